//! Media source: uploads host images into a texture it owns.

use crate::error::{Error, Result};
use crate::gpu::{Texture, TextureFormat};
use crate::media::{Media, PixelFormat};
use crate::pipeline::message::{ImageFormat, Message};
use crate::pipeline::node::NodeContext;
use tracing::debug;

#[derive(Default)]
pub struct ImageSource {
    media: Option<Media>,
    texture: Option<Texture>,
}

impl ImageSource {
    pub fn set_media(&mut self, media: Media) -> Result<()> {
        media.validate()?;
        self.media = Some(media);
        Ok(())
    }

    pub(crate) fn forget_texture(&mut self) {
        self.texture = None;
    }

    pub(crate) fn run(&mut self, name: &str, ctx: &mut NodeContext<'_>) -> Result<Vec<Message>> {
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| Error::IllegalOperation(format!("source '{name}' has no media")))?;

        let (pixels, format, image_format) = match media.format {
            PixelFormat::Grey => (media.data.clone(), TextureFormat::R8, ImageFormat::Greyscale),
            PixelFormat::Rgb | PixelFormat::Rgba => (media.to_rgba().data, TextureFormat::Rgba8, ImageFormat::Rgba),
        };

        let texture = match self.texture {
            Some(current) => ctx
                .pool
                .resize_exclusive(ctx.gpu, &current, media.width, media.height, format)?,
            None => ctx
                .pool
                .acquire_exclusive(ctx.gpu, name, media.width, media.height, format)?,
        };
        self.texture = Some(texture);

        ctx.gpu.upload(&texture, &pixels)?;
        debug!("Uploaded {}x{} media into {}", media.width, media.height, texture);
        Ok(vec![Message::Image {
            texture,
            format: image_format,
        }])
    }
}
