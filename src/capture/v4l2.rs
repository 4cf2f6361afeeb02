//! V4L2 analysis frames with an external encoder.
//!
//! A capture thread owns the device and its mmap stream and pushes converted
//! frames into a small bounded channel. A poll drains the channel and hands
//! back only the newest frame; the older ones are counted as dropped. While
//! the channel is full the capture thread drops instead of blocking, so the
//! driver keeps cycling its buffers. The full-resolution stream is produced
//! by a `CommandEncoder`.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{CaptureConfig, CaptureDevice, CommandEncoder};
use crate::frame::{pack_rows, Frame};

const FRAME_QUEUE_DEPTH: usize = 2;

enum CaptureMsg {
    Frame(Frame),
    Failed(String),
}

pub struct V4l2Camera {
    device: String,
    frames: Receiver<CaptureMsg>,
    shutdown: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
    encoder: CommandEncoder,
}

impl V4l2Camera {
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let argv = config
            .encoder_command
            .clone()
            .ok_or_else(|| anyhow!("device {} requires capture.encoder_command", config.device))?;
        let encoder = CommandEncoder::new(argv)?.with_stop_grace(config.encoder_stop_grace);

        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_cfg = config.clone();
        let thread_shutdown = shutdown.clone();
        let thread_dropped = dropped.clone();
        let join = std::thread::Builder::new()
            .name("v4l2-capture".to_string())
            .spawn(move || {
                capture_loop(thread_cfg, tx, ready_tx, thread_shutdown, thread_dropped)
            })
            .context("spawn v4l2 capture thread")?;

        // Surface open/format errors synchronously.
        match ready_rx.recv() {
            Ok(Ok((width, height))) => {
                log::info!(
                    "V4l2Camera: connected to {} ({}x{})",
                    config.device,
                    width,
                    height
                );
            }
            Ok(Err(err)) => {
                let _ = join.join();
                return Err(anyhow!("open v4l2 device {}: {}", config.device, err));
            }
            Err(_) => {
                let _ = join.join();
                return Err(anyhow!("v4l2 capture thread exited during setup"));
            }
        }

        Ok(Self {
            device: config.device,
            frames: rx,
            shutdown,
            dropped,
            join: Some(join),
            encoder,
        })
    }


impl CaptureDevice for V4l2Camera {
    fn start_encoding(&mut self, path: &Path) -> Result<()> {
        self.encoder.start(path)
    }

    fn stop_encoding(&mut self) -> Result<()> {
        self.encoder.stop()
    }

    fn is_encoding(&self) -> bool {
        self.encoder.is_running()
    }

    fn poll_low_res_frame(&mut self) -> Result<Option<Frame>> {
        self.encoder.check_alive()?;
        latest_frame(&self.frames, &self.dropped, &self.device)
    }

    /// Frames skipped because the controller was not polling fast enough.
    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain everything queued and keep the newest frame.
fn latest_frame(
    frames: &Receiver<CaptureMsg>,
    dropped: &AtomicU64,
    device: &str,
) -> Result<Option<Frame>> {
    let mut latest = None;
    loop {
        match frames.try_recv() {
            Ok(CaptureMsg::Frame(frame)) => {
                if latest.replace(frame).is_some() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(CaptureMsg::Failed(err)) => {
                return Err(anyhow!("capture {}: {}", device, err));
            }
            Err(TryRecvError::Empty) => return Ok(latest),
            Err(TryRecvError::Disconnected) => {
                if latest.is_some() {
                    return Ok(latest);
                }
                return Err(anyhow!("v4l2 capture thread for {} stopped", device));
            }
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[derive(Clone, Copy)]
enum Layout {
    Grey,
    Yuyv,
    Rgb24,
}

impl Layout {
    fn bytes_per_pixel(self) -> usize {
        match self {
            Layout::Grey => 1,
            Layout::Yuyv => 2,
            Layout::Rgb24 => 3,
        }
    }

    /// Convert one mapped buffer, honoring the driver's line stride.
    fn convert(self, width: u32, height: u32, stride: usize, buf: &[u8]) -> Result<Frame> {
        let row_bytes = width as usize * self.bytes_per_pixel();
        let packed = pack_rows(buf, row_bytes, stride, height as usize)?;
        match self {
            Layout::Grey => Frame::new(width, height, packed.into_owned()),
            Layout::Yuyv => Frame::from_yuyv(width, height, &packed),
            Layout::Rgb24 => Frame::from_rgb24(width, height, &packed),
        }
    }
}

fn capture_loop(
    config: CaptureConfig,
    tx: SyncSender<CaptureMsg>,
    ready: mpsc::Sender<std::result::Result<(u32, u32), String>>,
    shutdown: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    let setup = || -> Result<(v4l::Device, u32, u32, usize, Layout)> {
        let device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if config.framerate > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.framerate);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Camera: failed to set fps on {}: {}", config.device, err);
            }
        }
        let layout = if format.fourcc == v4l::FourCC::new(b"YUYV") {
            Layout::Yuyv
        } else if format.fourcc == v4l::FourCC::new(b"GREY") {
            Layout::Grey
        } else if format.fourcc == v4l::FourCC::new(b"RGB3") {
            Layout::Rgb24
        } else {
            return Err(anyhow!("unsupported v4l2 pixel format {}", format.fourcc));
        };
        Ok((
            device,
            format.width,
            format.height,
            format.stride as usize,
            layout,
        ))
    };

    let (device, width, height, stride, layout) = match setup() {
        Ok(opened) => opened,
        Err(err) => {
            let _ = ready.send(Err(format!("{:#}", err)));
            return;
        }
    };
    let mut stream = match v4l::prelude::MmapStream::with_buffers(&device, Type::VideoCapture, 4)
    {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(format!("create v4l2 buffer stream: {}", err)));
            return;
        }
    };
    let _ = ready.send(Ok((width, height)));

    while !shutdown.load(Ordering::SeqCst) {
        let msg = match stream.next() {
            Ok((buf, _meta)) => match layout.convert(width, height, stride, buf) {
                Ok(frame) => CaptureMsg::Frame(frame),
                Err(err) => CaptureMsg::Failed(format!("{:#}", err)),
            },
            Err(err) => CaptureMsg::Failed(format!("capture v4l2 frame: {}", err)),
        };
        let failed = matches!(msg, CaptureMsg::Failed(_));
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
        if failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_returns_newest_queued_frame_and_counts_skipped() -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let dropped = AtomicU64::new(0);
        tx.send(CaptureMsg::Frame(Frame::filled(2, 2, 1)?))?;
        tx.send(CaptureMsg::Frame(Frame::filled(2, 2, 2)?))?;

        let frame = latest_frame(&rx, &dropped, "/dev/video0")?.expect("frame");
        assert_eq!(frame.pixels(), &[2, 2, 2, 2]);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert!(latest_frame(&rx, &dropped, "/dev/video0")?.is_none());
        Ok(())
    }

    #[test]
    fn capture_failure_and_disconnect_are_errors() -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let dropped = AtomicU64::new(0);
        tx.send(CaptureMsg::Failed("dequeue failed".to_string()))?;
        let err = latest_frame(&rx, &dropped, "/dev/video0").unwrap_err();
        assert!(err.to_string().contains("dequeue failed"));

        tx.send(CaptureMsg::Frame(Frame::filled(2, 2, 5)?))?;
        drop(tx);
        // a frame queued before the thread stopped is still delivered
        assert!(latest_frame(&rx, &dropped, "/dev/video0")?.is_some());
        assert!(latest_frame(&rx, &dropped, "/dev/video0").is_err());
        Ok(())
    }

    #[test]
    fn padded_buffers_convert_for_every_layout() -> Result<()> {
        // 2x2 frames with a stride of 8 bytes and trailing bytes in the mapping
        let mut grey = vec![0u8; 8 * 2 + 4];
        grey[..2].copy_from_slice(&[1, 2]);
        grey[8..10].copy_from_slice(&[3, 4]);
        assert_eq!(Layout::Grey.convert(2, 2, 8, &grey)?.pixels(), &[1, 2, 3, 4]);

        let mut yuyv = vec![0u8; 8 * 2 + 4];
        yuyv[..4].copy_from_slice(&[1, 128, 2, 128]);
        yuyv[8..12].copy_from_slice(&[3, 128, 4, 128]);
        assert_eq!(Layout::Yuyv.convert(2, 2, 8, &yuyv)?.pixels(), &[1, 2, 3, 4]);

        let mut rgb = vec![0u8; 8 * 2 + 4];
        rgb[..6].copy_from_slice(&[1, 1, 1, 2, 2, 2]);
        rgb[8..14].copy_from_slice(&[3, 3, 3, 4, 4, 4]);
        assert_eq!(Layout::Rgb24.convert(2, 2, 8, &rgb)?.pixels(), &[1, 2, 3, 4]);
        Ok(())
    }
}
