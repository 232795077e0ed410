use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{IqBatch, IqSample, SampleSource, TunableRange};
use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamFormat {
    /// rtl_tcp native: unsigned 8-bit, centered on 127.5
    Uint8,
    Int8,
    Int16,
    Int32,
    Float32,
}

impl StreamFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            StreamFormat::Uint8 => 2,   // I + Q = 2 bytes
            StreamFormat::Int8 => 2,    // I + Q = 2 bytes
            StreamFormat::Int16 => 4,   // I + Q = 4 bytes
            StreamFormat::Int32 => 8,   // I + Q = 8 bytes
            StreamFormat::Float32 => 8, // I + Q = 8 bytes
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "uint8" | "u8" => Some(StreamFormat::Uint8),
            "int8" => Some(StreamFormat::Int8),
            "int16" => Some(StreamFormat::Int16),
            "int32" => Some(StreamFormat::Int32),
            "float32" => Some(StreamFormat::Float32),
            _ => None,
        }
    }

    /// Convert raw interleaved bytes into samples
    pub fn decode(&self, buffer: &[u8]) -> Vec<IqSample> {
        match self {
            StreamFormat::Uint8 => buffer
                .chunks_exact(2)
                .map(|chunk| {
                    let i = (chunk[0] as f32 - 127.5) / 127.5;
                    let q = (chunk[1] as f32 - 127.5) / 127.5;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Int8 => buffer
                .chunks_exact(2)
                .map(|chunk| {
                    let i = (chunk[0] as i8) as f32 / 128.0;
                    let q = (chunk[1] as i8) as f32 / 128.0;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Int16 => buffer
                .chunks_exact(4)
                .map(|chunk| {
                    let i = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0;
                    let q = i16::from_le_bytes([chunk[2], chunk[3]]) as f32 / 32768.0;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Int32 => buffer
                .chunks_exact(8)
                .map(|chunk| {
                    let i = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32
                        / 2147483648.0;
                    let q = i32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as f32
                        / 2147483648.0;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Float32 => buffer
                .chunks_exact(8)
                .map(|chunk| {
                    let i = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let q = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
                    IqSample::new(i, q)
                })
                .collect(),
        }
    }
}

// rtl_tcp command opcodes
const CMD_SET_FREQUENCY: u8 = 0x01;
const CMD_SET_SAMPLE_RATE: u8 = 0x02;
const CMD_SET_GAIN_MODE: u8 = 0x03;
const CMD_SET_GAIN: u8 = 0x04;

const GREETING_MAGIC: &[u8; 4] = b"RTL0";

/// Socket read size while assembling a batch
const READ_CHUNK: usize = 64 * 1024;

/// Connection settings for an rtl_tcp server
#[derive(Debug, Clone)]
pub struct RtlTcpConfig {
    pub addr: String,
    pub format: StreamFormat,
    pub sample_rate: u32,
    pub center_freq_hz: u64,
    /// Manual gain in dB; `None` leaves the tuner in AGC mode
    pub gain_db: Option<f32>,
    pub read_timeout: Duration,
    pub range: TunableRange,
}

/// Receiver attached over TCP, speaking the rtl_tcp command protocol.
///
/// With `StreamFormat::Uint8` the server greeting is consumed and tuning
/// commands are sent upstream. Other formats treat the socket as a plain IQ
/// feed (e.g. an SDR++ network sink) that has no command channel, so retuning
/// only updates the tag on produced batches.
pub struct RtlTcpSource {
    reader: Option<BufReader<TcpStream>>,
    control: Option<TcpStream>,
    format: StreamFormat,
    sample_rate: u32,
    center_freq_hz: u64,
    read_timeout: Duration,
    range: TunableRange,
    addr: String,
    total_samples: u64,
    /// Bytes received towards a batch that timed out; the next read resumes here
    pending: Vec<u8>,
}

impl RtlTcpSource {
    /// A center outside `range` starts at the nearest accepted frequency
    pub fn connect(config: RtlTcpConfig) -> Result<Self, SourceError> {
        let center_freq_hz = config.range.clamp(config.center_freq_hz);
        if center_freq_hz != config.center_freq_hz {
            warn!(
                "{} Hz outside tunable range, starting at {} Hz",
                config.center_freq_hz, center_freq_hz
            );
        }

        let sock_addr = config
            .addr
            .to_socket_addrs()
            .map_err(|e| SourceError::device(format!("bad address {}: {}", config.addr, e)))?
            .next()
            .ok_or_else(|| SourceError::device(format!("no address for {}", config.addr)))?;

        info!("Connecting to {}", config.addr);
        let stream = TcpStream::connect_timeout(&sock_addr, config.read_timeout)
            .map_err(|e| SourceError::device(format!("connect {}: {}", config.addr, e)))?;
        stream
            .set_read_timeout(Some(config.read_timeout))
            .map_err(|e| SourceError::device(e.to_string()))?;
        let control = stream
            .try_clone()
            .map_err(|e| SourceError::device(e.to_string()))?;

        let mut source = Self {
            reader: Some(BufReader::new(stream)),
            control: Some(control),
            format: config.format,
            sample_rate: config.sample_rate,
            center_freq_hz,
            read_timeout: config.read_timeout,
            range: config.range,
            addr: config.addr,
            total_samples: 0,
            pending: Vec::new(),
        };

        if source.has_command_channel() {
            source.read_greeting()?;
            source.send_command(CMD_SET_SAMPLE_RATE, config.sample_rate)?;
            source.send_command(CMD_SET_FREQUENCY, freq_to_u32(center_freq_hz)?)?;
            match config.gain_db {
                Some(gain) => {
                    source.send_command(CMD_SET_GAIN_MODE, 1)?;
                    source.send_command(CMD_SET_GAIN, (gain * 10.0).round().max(0.0) as u32)?;
                }
                None => source.send_command(CMD_SET_GAIN_MODE, 0)?,
            }
        }

        info!(
            "Connected to {} ({:?}, {} Hz, center {} Hz)",
            source.addr, source.format, source.sample_rate, source.center_freq_hz
        );
        Ok(source)
    }

    fn has_command_channel(&self) -> bool {
        self.format == StreamFormat::Uint8
    }

    fn read_greeting(&mut self) -> Result<(), SourceError> {
        let reader = self.reader.as_mut().ok_or(SourceError::DeviceDisconnected)?;
        let mut header = [0u8; 12];
        reader.read_exact(&mut header).map_err(map_read_error(self.read_timeout))?;
        if &header[..4] != GREETING_MAGIC {
            return Err(SourceError::device("missing RTL0 greeting from server"));
        }
        let tuner = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let gains = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        debug!("rtl_tcp tuner type {}, {} gain steps", tuner, gains);
        Ok(())
    }

    fn send_command(&mut self, cmd: u8, param: u32) -> Result<(), SourceError> {
        let control = self.control.as_mut().ok_or(SourceError::DeviceDisconnected)?;
        let mut packet = [0u8; 5];
        packet[0] = cmd;
        packet[1..].copy_from_slice(&param.to_be_bytes());
        control
            .write_all(&packet)
            .map_err(|e| SourceError::device(format!("command 0x{:02x} failed: {}", cmd, e)))
    }
}

fn freq_to_u32(freq_hz: u64) -> Result<u32, SourceError> {
    u32::try_from(freq_hz)
        .map_err(|_| SourceError::device(format!("{} Hz not representable by rtl_tcp", freq_hz)))
}

fn map_read_error(timeout: Duration) -> impl Fn(std::io::Error) -> SourceError {
    move |e| match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            SourceError::AcquisitionTimeout(timeout.as_millis() as u64)
        }
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            SourceError::DeviceDisconnected
        }
        _ => SourceError::device(e.to_string()),
    }
}

impl SampleSource for RtlTcpSource {
    fn name(&self) -> String {
        format!("rtl_tcp {}", self.addr)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn center_freq_hz(&self) -> u64 {
        self.center_freq_hz
    }

    fn retune(&mut self, freq_hz: u64) -> Result<(), SourceError> {
        self.range.check(freq_hz)?;
        if self.reader.is_none() {
            return Err(SourceError::DeviceDisconnected);
        }
        if self.has_command_channel() {
            self.send_command(CMD_SET_FREQUENCY, freq_to_u32(freq_hz)?)?;
        }
        self.center_freq_hz = freq_hz;
        Ok(())
    }

    /// Read a batch of IQ samples from the stream.
    ///
    /// The whole batch must arrive within `read_timeout`. On timeout the bytes
    /// received so far are kept, so sample alignment survives a stall.
    fn read(&mut self, batch_size: usize) -> Result<IqBatch, SourceError> {
        let timeout = self.read_timeout;
        let needed = batch_size * self.format.bytes_per_sample();
        let reader = self.reader.as_mut().ok_or(SourceError::DeviceDisconnected)?;
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];

        while self.pending.len() < needed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Batch incomplete, {} of {} bytes buffered", self.pending.len(), needed);
                return Err(SourceError::AcquisitionTimeout(timeout.as_millis() as u64));
            }
            reader
                .get_ref()
                .set_read_timeout(Some(remaining))
                .map_err(|e| SourceError::device(e.to_string()))?;

            let want = (needed - self.pending.len()).min(READ_CHUNK);
            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Err(SourceError::DeviceDisconnected),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(map_read_error(timeout)(e)),
            }
        }

        let samples = self.format.decode(&self.pending[..needed]);
        self.pending.drain(..needed);
        self.total_samples += samples.len() as u64;
        Ok(IqBatch::new(samples, self.sample_rate, self.center_freq_hz))
    }

    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.get_ref().shutdown(Shutdown::Both) {
                warn!("Error shutting down {}: {}", self.addr, e);
            }
            info!(
                "Closed {} after {} samples",
                self.addr, self.total_samples
            );
        }
        self.control = None;
        self.pending.clear();
    }
}

impl Drop for RtlTcpSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn config(addr: String, format: StreamFormat) -> RtlTcpConfig {
        RtlTcpConfig {
            addr,
            format,
            sample_rate: 2_048_000,
            center_freq_hz: 100_000_000,
            gain_db: None,
            read_timeout: Duration::from_millis(300),
            range: TunableRange {
                min_hz: 24_000_000,
                max_hz: 1_766_000_000,
            },
        }
    }

    #[test]
    fn test_decode_uint8_centers_on_zero() {
        let samples = StreamFormat::Uint8.decode(&[255, 0, 128, 127]);
        assert_eq!(samples.len(), 2);
        assert!((samples[0].i - 1.0).abs() < 1e-6);
        assert!((samples[0].q + 1.0).abs() < 1e-6);
        assert!(samples[1].i.abs() < 0.01);
        assert!(samples[1].q.abs() < 0.01);
    }

    #[test]
    fn test_decode_float32() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-0.25f32).to_le_bytes());
        let samples = StreamFormat::Float32.decode(&bytes);
        assert_eq!(samples, vec![IqSample::new(0.5, -0.25)]);
    }

    #[test]
    fn test_parse_format_names() {
        assert_eq!(StreamFormat::parse("UINT8"), Some(StreamFormat::Uint8));
        assert_eq!(StreamFormat::parse("int16"), Some(StreamFormat::Int16));
        assert_eq!(StreamFormat::parse("complex"), None);
    }

    #[test]
    fn test_rtl_tcp_handshake_retune_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut greeting = Vec::from(&b"RTL0"[..]);
            greeting.extend_from_slice(&5u32.to_be_bytes());
            greeting.extend_from_slice(&29u32.to_be_bytes());
            sock.write_all(&greeting).unwrap();

            // sample rate, frequency, gain mode, then one retune
            let mut commands = [0u8; 20];
            sock.read_exact(&mut commands).unwrap();
            sock.write_all(&[255u8, 0, 255, 0, 255, 0, 255, 0]).unwrap();
            commands
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Uint8)).unwrap();
        source.retune(96_500_000).unwrap();
        let batch = source.read(4).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.center_freq_hz, 96_500_000);

        let commands = server.join().unwrap();
        assert_eq!(commands[0], CMD_SET_SAMPLE_RATE);
        assert_eq!(u32::from_be_bytes([commands[1], commands[2], commands[3], commands[4]]), 2_048_000);
        assert_eq!(commands[5], CMD_SET_FREQUENCY);
        assert_eq!(commands[10], CMD_SET_GAIN_MODE);
        assert_eq!(commands[15], CMD_SET_FREQUENCY);
        assert_eq!(
            u32::from_be_bytes([commands[16], commands[17], commands[18], commands[19]]),
            96_500_000
        );
    }

    #[test]
    fn test_retune_out_of_range_keeps_frequency() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(100));
            drop(sock);
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Float32)).unwrap();
        let err = source.retune(1_000_000).unwrap_err();
        assert!(matches!(err, SourceError::Device(_)));
        assert_eq!(source.center_freq_hz(), 100_000_000);
        server.join().unwrap();
    }

    #[test]
    fn test_eof_reports_disconnect_and_short_data_is_not_returned() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Only half of one requested sample
            sock.write_all(&[0u8; 4]).unwrap();
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Float32)).unwrap();
        server.join().unwrap();
        let err = source.read(2).unwrap_err();
        assert!(matches!(err, SourceError::DeviceDisconnected));
    }

    #[test]
    fn test_read_times_out_when_server_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(sock);
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Int16)).unwrap();
        let err = source.read(16).unwrap_err();
        assert!(matches!(err, SourceError::AcquisitionTimeout(300)));
        source.close();
        server.join().unwrap();
    }

    #[test]
    fn test_stall_mid_sample_keeps_alignment() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut bytes = Vec::new();
            for v in [0.5f32, -0.25, 0.75, 0.125] {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            sock.write_all(&bytes[..4]).unwrap();
            sock.flush().unwrap();
            thread::sleep(Duration::from_millis(450));
            sock.write_all(&bytes[4..]).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Float32)).unwrap();
        let err = source.read(1).unwrap_err();
        assert!(matches!(err, SourceError::AcquisitionTimeout(300)));

        let first = source.read(1).unwrap();
        assert_eq!(first.samples(), &[IqSample::new(0.5, -0.25)]);
        let second = source.read(1).unwrap();
        assert_eq!(second.samples(), &[IqSample::new(0.75, 0.125)]);
        server.join().unwrap();
    }

    #[test]
    fn test_trickling_server_is_bounded_by_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // one byte every 50 ms, far below the rate the batch needs
            for _ in 0..30 {
                if sock.write_all(&[1u8]).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Int16)).unwrap();
        let started = Instant::now();
        let err = source.read(256).unwrap_err();
        assert!(matches!(err, SourceError::AcquisitionTimeout(300)));
        assert!(started.elapsed() < Duration::from_millis(700));
        source.close();
        server.join().unwrap();
    }

    #[test]
    fn test_connect_below_range_starts_at_range_minimum() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(100));
            drop(sock);
        });

        let mut cfg = config(addr, StreamFormat::Float32);
        cfg.center_freq_hz = 1_000_000;
        let source = RtlTcpSource::connect(cfg).unwrap();
        assert_eq!(source.center_freq_hz(), 24_000_000);
        server.join().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });

        let mut source = RtlTcpSource::connect(config(addr, StreamFormat::Int8)).unwrap();
        source.close();
        source.close();
        assert!(matches!(source.read(1), Err(SourceError::DeviceDisconnected)));
        assert!(matches!(source.retune(100_000_000), Err(SourceError::DeviceDisconnected)));
        server.join().unwrap();
    }
}
