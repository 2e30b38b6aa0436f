//! Camera-side simulator: serves frames to one receiving client.

use anyhow::{Context, Result};
use evstream_core::{Config, Event, FrameEncoder};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Where replayed frame payloads come from.
pub enum FrameSource {
    /// Raw dump of concatenated frame payloads
    File(PathBuf),
    /// Generated vertical bar sweeping across the sensor
    Sweep,
}

pub struct ReplayOptions {
    pub listen: SocketAddr,
    pub source: FrameSource,
    pub fps: f64,
    pub repeat: bool,
    pub max_frames: Option<u64>,
}

/// Accepts one client and streams frames until the source runs out, the
/// client goes away, or `stop` is raised. Returns the number of frames sent.
pub fn serve(config: Arc<Config>, opts: &ReplayOptions, stop: &AtomicBool) -> Result<u64> {
    let listener = TcpListener::bind(opts.listen)
        .with_context(|| format!("Failed to listen on {}", opts.listen))?;
    info!(addr = %listener.local_addr()?, "waiting for receiver");

    let Some(mut stream) = accept_until(&listener, stop)? else {
        info!("stopped before a receiver connected");
        return Ok(0);
    };
    stream.set_nodelay(config.tcp_nodelay)?;

    let header = vec![0u8; config.header_size];
    let mut frames = Frames::open(config.clone(), &opts.source, opts.repeat)?;
    let period = if opts.fps > 0.0 {
        Duration::from_secs_f64(1.0 / opts.fps)
    } else {
        Duration::ZERO
    };

    let mut sent = 0u64;
    let mut payload = Vec::with_capacity(config.frame_size());
    while !stop.load(Ordering::Relaxed) && opts.max_frames.map_or(true, |max| sent < max) {
        let started = Instant::now();
        if !frames.next_frame(&mut payload)? {
            break;
        }

        let written = stream
            .write_all(&header)
            .and_then(|()| stream.write_all(&payload));
        match written {
            Ok(()) => sent += 1,
            Err(err) if matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                info!("receiver disconnected");
                break;
            }
            Err(err) => return Err(err).context("Failed to send frame"),
        }

        if let Some(rest) = period.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    info!(frames = sent, "replay finished");
    Ok(sent)
}

/// Waits for one receiver, giving up once `stop` is raised.
fn accept_until(listener: &TcpListener, stop: &AtomicBool) -> Result<Option<TcpStream>> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                info!(%peer, "receiver connected");
                return Ok(Some(stream));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if stop.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("Failed to accept receiver"),
        }
    }
}

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Frames {
    File {
        path: PathBuf,
        reader: BufReader<File>,
        frame_size: usize,
        repeat: bool,
    },
    Sweep {
        encoder: FrameEncoder,
        config: Arc<Config>,
        position: u32,
        events: Vec<Event>,
    },
}

impl Frames {
    fn open(config: Arc<Config>, source: &FrameSource, repeat: bool) -> Result<Self> {
        Ok(match source {
            FrameSource::File(path) => Frames::File {
                reader: open_dump(path)?,
                path: path.clone(),
                frame_size: config.frame_size(),
                repeat,
            },
            FrameSource::Sweep => Frames::Sweep {
                encoder: FrameEncoder::new(config.clone()),
                config,
                position: 0,
                events: Vec::new(),
            },
        })
    }

    /// Fills `payload` with the next frame. Returns `false` when exhausted.
    fn next_frame(&mut self, payload: &mut Vec<u8>) -> Result<bool> {
        match self {
            Frames::File {
                path,
                reader,
                frame_size,
                repeat,
            } => {
                payload.resize(*frame_size, 0);
                let mut reopened = false;
                loop {
                    match reader.read_exact(payload) {
                        Ok(()) => return Ok(true),
                        // A trailing partial frame is dropped.
                        Err(err) if err.kind() == ErrorKind::UnexpectedEof && *repeat && !reopened => {
                            *reader = open_dump(path)?;
                            reopened = true;
                        }
                        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(false),
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("Failed to read {}", path.display()))
                        }
                    }
                }
            }
            Frames::Sweep {
                encoder,
                config,
                position,
                events,
            } => {
                // Leading edge is positive, trailing edge negative.
                let lead = *position % config.width;
                let trail = (lead + config.width - 1) % config.width;
                events.clear();
                for y in 0..config.height {
                    events.push(Event::new(0, lead as u16, y as u16, true));
                    if config.width > 1 {
                        events.push(Event::new(0, trail as u16, y as u16, false));
                    }
                }
                encoder.encode(events, payload)?;
                *position = position.wrapping_add(1);
                Ok(true)
            }
        }
    }
}

fn open_dump(path: &Path) -> Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open frame dump {}", path.display()))?;
    Ok(BufReader::new(file))
}
