//! GPU→host pixel readback with an optional multi-buffered async protocol.
//!
//! The reader owns `N` host buffers. Every buffer sits in exactly one of two
//! FIFO queues: the producer queue (free, or the destination of an in-flight
//! transfer) and the consumer queue (holding pixels ready for the host).
//! In-flight producer entries always precede free ones, so transfers land in
//! the order they were issued.
//!
//! Each buffer remembers the region it was last filled from, so a buffered
//! read returns pixels together with the geometry they were captured at,
//! which may differ from the texture being read now.

use super::{GpuContext, PixelTransfer, Region, Texture};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::future::poll_fn;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

struct ProducerSlot {
    index: usize,
    transfer: Option<Transfer>,
}

struct Transfer {
    pixels: PixelTransfer,
    region: Region,
}

/// What a host buffer currently holds: the region and its byte length.
#[derive(Debug, Clone, Copy)]
struct Contents {
    region: Region,
    len: usize,
}

pub struct TextureReader {
    buffers: Vec<Vec<u8>>,
    /// `None` until a transfer lands in the buffer.
    contents: Vec<Option<Contents>>,
    producer: VecDeque<ProducerSlot>,
    consumer: VecDeque<usize>,
    /// Transfers issued while no producer buffer was free.
    pending: VecDeque<Transfer>,
}

impl TextureReader {
    /// Create a reader with `buffers` host buffers, all initially ready
    /// (and zeroed).
    pub fn new(buffers: usize) -> Result<Self> {
        if buffers == 0 {
            return Err(Error::IllegalArgument("a texture reader needs at least one buffer".to_string()));
        }
        Ok(Self {
            buffers: vec![Vec::new(); buffers],
            contents: vec![None; buffers],
            producer: VecDeque::with_capacity(buffers),
            consumer: (0..buffers).collect(),
            pending: VecDeque::new(),
        })
    }

    /// Current size of every host buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.buffers[0].len()
    }

    /// `(producer, consumer)` queue lengths.
    pub fn queue_lengths(&self) -> (usize, usize) {
        (self.producer.len(), self.consumer.len())
    }

    /// Blocking readback into buffer 0.
    pub fn read_pixels_sync(&mut self, gpu: &mut dyn GpuContext, texture: &Texture, region: Option<Region>) -> Result<&[u8]> {
        let region = region.unwrap_or_else(|| texture.full_region()).clamp_to(texture);
        let size = region.byte_len(texture.format);
        self.reallocate(size);

        if region.is_empty() {
            return Ok(&self.buffers[0][..0]);
        }
        if gpu.is_context_lost() {
            warn!("GPU context lost; returning stale pixels");
            return Ok(&self.buffers[0][..size]);
        }

        gpu.read_pixels(texture, region, &mut self.buffers[0][..size])?;
        self.contents[0] = Some(Contents { region, len: size });
        Ok(&self.buffers[0][..size])
    }

    /// Asynchronous readback.
    ///
    /// Without buffered downloads the transfer is awaited and the pixels
    /// land in buffer 0. With buffered downloads the call issues a transfer
    /// and returns the oldest ready buffer, which holds pixels from an
    /// earlier call (or zeroes before the first transfer completes).
    pub async fn read_pixels_async(
        &mut self,
        gpu: &mut dyn GpuContext,
        texture: &Texture,
        use_buffered_downloads: bool,
        region: Option<Region>,
    ) -> Result<&[u8]> {
        let (_, pixels) = self
            .read_region_async(gpu, texture, use_buffered_downloads, region)
            .await?;
        Ok(pixels)
    }

    /// Like [`read_pixels_async`](Self::read_pixels_async), but also returns
    /// the region the pixels were captured from. With buffered downloads that
    /// is the region of the earlier request that filled the buffer; a buffer
    /// that was never filled reports the current request's region.
    pub async fn read_region_async(
        &mut self,
        gpu: &mut dyn GpuContext,
        texture: &Texture,
        use_buffered_downloads: bool,
        region: Option<Region>,
    ) -> Result<(Region, &[u8])> {
        let region = region.unwrap_or_else(|| texture.full_region()).clamp_to(texture);
        let size = region.byte_len(texture.format);
        self.reallocate(size);

        if region.is_empty() {
            return Ok((region, &self.buffers[0][..0]));
        }
        if gpu.is_context_lost() {
            warn!("GPU context lost; returning stale pixels");
            return Ok((region, &self.buffers[0][..size]));
        }

        if !use_buffered_downloads {
            let transfer = issue(gpu, texture, region)?;
            let pixels = transfer.await.map_err(|cause| {
                warn!("Pixel transfer failed: {}", cause);
                Error::operation("Can't read pixels", cause)
            })?;
            let buffer = &mut self.buffers[0];
            if pixels.len() > buffer.len() {
                return Err(Error::IllegalArgument(format!(
                    "transfer of {} bytes does not fit a {} byte buffer",
                    pixels.len(),
                    buffer.len()
                )));
            }
            buffer[..pixels.len()].copy_from_slice(&pixels);
            self.contents[0] = Some(Contents { region, len: size });
            return Ok((region, &self.buffers[0][..size]));
        }

        let pixels = issue(gpu, texture, region)?;
        self.pending.push_back(Transfer { pixels, region });
        self.assign_pending();

        poll_fn(|cx| self.poll_until_ready(cx)).await?;

        let ready = self
            .consumer
            .pop_front()
            .ok_or_else(|| Error::IllegalOperation("no buffer is ready".to_string()))?;
        self.producer.push_back(ProducerSlot {
            index: ready,
            transfer: None,
        });
        self.assign_pending();
        self.check_invariant();
        let Contents { region, len } = self.contents[ready].unwrap_or(Contents { region, len: size });
        Ok((region, &self.buffers[ready][..len]))
    }

    /// Grow every buffer to hold at least `size` bytes. Buffers never shrink
    /// and keep their contents.
    fn reallocate(&mut self, size: usize) {
        if size <= self.capacity() {
            return;
        }
        debug!("Growing {} readback buffers to {} bytes", self.buffers.len(), size);
        for buffer in &mut self.buffers {
            buffer.resize(size, 0);
        }
    }

    /// Attach queued transfers to the oldest free producer buffers.
    fn assign_pending(&mut self) {
        while !self.pending.is_empty() {
            let Some(slot) = self.producer.iter_mut().find(|slot| slot.transfer.is_none()) else {
                break;
            };
            slot.transfer = self.pending.pop_front();
        }
    }

    /// Move every completed transfer at the head of the producer queue to
    /// the consumer queue.
    fn poll_transfers(&mut self, cx: &mut Context<'_>) -> Result<()> {
        loop {
            let Some(transfer) = self.producer.front_mut().and_then(|slot| slot.transfer.as_mut()) else {
                return Ok(());
            };
            let outcome = match Pin::new(&mut transfer.pixels).poll(cx) {
                Poll::Pending => return Ok(()),
                Poll::Ready(outcome) => outcome,
            };
            let Some(slot) = self.producer.pop_front() else {
                return Ok(());
            };
            let index = slot.index;
            let region = slot.transfer.map(|transfer| transfer.region);

            match outcome {
                Ok(pixels) if pixels.len() <= self.buffers[index].len() => {
                    self.buffers[index][..pixels.len()].copy_from_slice(&pixels);
                    self.contents[index] = region.map(|region| Contents { region, len: pixels.len() });
                    self.consumer.push_back(index);
                }
                Ok(pixels) => {
                    self.release_to_producer(index);
                    return Err(Error::IllegalArgument(format!(
                        "transfer of {} bytes does not fit a {} byte buffer",
                        pixels.len(),
                        self.buffers[index].len()
                    )));
                }
                Err(cause) => {
                    warn!("Buffered pixel transfer failed: {}", cause);
                    self.release_to_producer(index);
                    return Err(Error::operation("Can't read pixels", cause));
                }
            }
        }
    }

    fn release_to_producer(&mut self, index: usize) {
        self.producer.push_back(ProducerSlot { index, transfer: None });
        self.assign_pending();
        self.check_invariant();
    }

    /// Ready once the consumer queue is non-empty; otherwise parked on the
    /// oldest in-flight transfer's waker.
    fn poll_until_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Err(err) = self.poll_transfers(cx) {
            return Poll::Ready(Err(err));
        }
        if !self.consumer.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if self.producer.front().is_some_and(|slot| slot.transfer.is_some()) {
            Poll::Pending
        } else {
            Poll::Ready(Err(Error::IllegalOperation("no buffer is ready and no transfer is in flight".to_string())))
        }
    }

    fn check_invariant(&self) {
        debug_assert_eq!(self.contents.len(), self.buffers.len());
        debug_assert_eq!(self.producer.len() + self.consumer.len(), self.buffers.len());
        debug_assert!({
            let mut seen = vec![false; self.buffers.len()];
            self.producer
                .iter()
                .map(|slot| slot.index)
                .chain(self.consumer.iter().copied())
                .all(|index| !std::mem::replace(&mut seen[index], true))
        });
        debug_assert!(self
            .producer
            .iter()
            .skip_while(|slot| slot.transfer.is_some())
            .all(|slot| slot.transfer.is_none()));
    }
}

fn issue(gpu: &mut dyn GpuContext, texture: &Texture, region: Region) -> Result<PixelTransfer> {
    gpu.read_pixels_async(texture, region).map_err(|cause| {
        warn!("Can't issue pixel transfer from {}: {}", texture, cause);
        Error::operation("Can't read pixels", Box::new(cause))
    })
}
