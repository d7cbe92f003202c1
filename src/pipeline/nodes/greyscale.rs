use super::input;
use crate::error::{Error, Result};
use crate::gpu::Args;
use crate::pipeline::message::{ImageFormat, Message};
use crate::pipeline::node::NodeContext;

/// Converts RGBA images to greyscale; greyscale images pass through.
pub struct Greyscale;

impl Greyscale {
    pub(crate) fn run(&mut self, name: &str, ctx: &mut NodeContext<'_>, inputs: &[Option<Message>]) -> Result<Vec<Message>> {
        let message = input(name, inputs, 0)?;
        let grey = match message {
            Message::Image {
                texture,
                format: ImageFormat::Rgba,
            } => ctx
                .programs
                .utils
                .run(ctx.gpu, ctx.pool, "rgb2grey", &Args::new().with("image", texture))?,
            Message::Image { texture, .. } => texture,
            other => {
                return Err(Error::Type(format!(
                    "'{name}' expects an image, got {}",
                    other.kind()
                )))
            }
        };
        Ok(vec![Message::Image {
            texture: grey,
            format: ImageFormat::Greyscale,
        }])
    }
}
