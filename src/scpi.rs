use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use log::{debug, info};

use crate::analysis::analyze_waveform;
use crate::error::CommunicationError;
use crate::parse::{block_header, identity, scpi_value};
use crate::settings::InstrumentSettings;
use crate::snapshot::{HarmonicSnapshot, SnapshotRequest, SnapshotSource};

/// Vertical codes per division in `DAT2` waveform data.
const CODES_PER_DIV: f64 = 25.0;

/// Longest `#<d><len>` prefix we are prepared to read.
const MAX_BLOCK_HEADER: usize = 2 + 9;

/// One channel record converted to volts.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f64>,
    pub sample_rate: f64,
}

/// SCPI-over-TCP link to a Siglent SDS oscilloscope.
pub struct Sds {
    reader: BufReader<TcpStream>,
    addr: String,
    settings: InstrumentSettings,
}

impl Sds {
    /// Opens the link and checks that something answering `*IDN?` is there.
    pub fn connect(
        host: &str,
        port: u16,
        settings: &InstrumentSettings,
    ) -> Result<Self, CommunicationError> {
        let addr = format!("{}:{}", host, port);
        let timeout = settings.io_timeout();
        let connect_err = |source| CommunicationError::Connect {
            addr: addr.clone(),
            source,
        };

        let candidates = (host, port).to_socket_addrs().map_err(connect_err)?;
        let mut last_err = None;
        let mut stream = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(target: "scpi", "connect to {} failed: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                return Err(connect_err(last_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
                })))
            }
        };
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let mut sds = Self {
            reader: BufReader::new(stream),
            addr,
            settings: settings.clone(),
        };
        let idn = sds.query("*IDN?")?;
        match identity(&idn) {
            Some((maker, model)) => info!(target: "scpi", "connected to {} {} at {}", maker, model, sds.addr),
            None => {
                return Err(CommunicationError::Malformed {
                    command: "*IDN?".to_string(),
                    response: idn,
                })
            }
        }
        Ok(sds)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn write(&mut self, command: &str) -> Result<(), CommunicationError> {
        debug!(target: "scpi", "-> {}", command);
        let stream = self.reader.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    /// Sends `command` and returns the next non-empty response line.
    pub fn query(&mut self, command: &str) -> Result<String, CommunicationError> {
        self.write(command)?;
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed while waiting for `{}`", command),
                )
                .into());
            }
            let line = line.trim();
            if !line.is_empty() {
                debug!(target: "scpi", "<- {}", line);
                return Ok(line.to_string());
            }
        }
    }

    pub fn query_value(&mut self, command: &str) -> Result<f64, CommunicationError> {
        let response = self.query(command)?;
        scpi_value(&response).ok_or_else(|| CommunicationError::Malformed {
            command: command.to_string(),
            response,
        })
    }

    /// Reads a `<prefix>#<d><len><payload>` reply; trailing line feeds are
    /// left for [`Self::query`] to skip.
    fn read_block(&mut self, command: &str) -> Result<Vec<u8>, CommunicationError> {
        let mut prefix = Vec::new();
        self.reader.read_until(b'#', &mut prefix)?;
        if prefix.last() != Some(&b'#') {
            return Err(CommunicationError::Malformed {
                command: command.to_string(),
                response: String::from_utf8_lossy(&prefix).into_owned(),
            });
        }

        let mut header = vec![b'#'];
        let mut width = [0u8; 1];
        self.reader.read_exact(&mut width)?;
        header.push(width[0]);
        let digits = (width[0] as char).to_digit(10).unwrap_or(0) as usize;
        if digits == 0 || header.len() + digits > MAX_BLOCK_HEADER {
            return Err(CommunicationError::Malformed {
                command: command.to_string(),
                response: String::from_utf8_lossy(&header).into_owned(),
            });
        }
        let mut len_digits = vec![0u8; digits];
        self.reader.read_exact(&mut len_digits)?;
        header.extend_from_slice(&len_digits);

        let len = block_header(&header)
            .map(|(_, len)| len)
            .map_err(|_| CommunicationError::Malformed {
                command: command.to_string(),
                response: String::from_utf8_lossy(&header).into_owned(),
            })?;

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Pulls the current record of `channel` (0-based) in volts.
    pub fn fetch_waveform(&mut self, channel: u8) -> Result<Waveform, CommunicationError> {
        let ch = format!("C{}", channel + 1);
        let vdiv = self.query_value(&format!("{}:VDIV?", ch))?;
        let offset = self.query_value(&format!("{}:OFST?", ch))?;
        let sample_rate = self.query_value("SARA?")?;
        let total_points = self.query_value(&format!("SANU? {}", ch))?;

        let max_points = self.settings.max_points.max(1);
        let sparsing = sparsing_for(total_points, max_points);
        self.write(&format!("WFSU SP,{},NP,{},FP,0", sparsing, max_points))?;

        let command = format!("{}:WF? DAT2", ch);
        self.write(&command)?;
        let payload = self.read_block(&command)?;

        let samples = codes_to_volts(&payload, vdiv, offset);
        let sample_rate = sample_rate / sparsing as f64;
        debug!(
            target: "scpi",
            "{}: {} samples at {:.1} Sa/s (vdiv {}, offset {}, sparsing {})",
            ch,
            samples.len(),
            sample_rate,
            vdiv,
            offset,
            sparsing
        );
        Ok(Waveform { samples, sample_rate })
    }
}

impl SnapshotSource for Sds {
    fn fetch_snapshot(
        &mut self,
        request: &SnapshotRequest,
    ) -> Result<HarmonicSnapshot, CommunicationError> {
        let waveform = self.fetch_waveform(request.channel)?;
        analyze_waveform(
            &waveform.samples,
            waveform.sample_rate,
            request,
            self.settings.window,
        )
    }
}

/// Smallest decimation that keeps a record within `max_points`.
pub fn sparsing_for(total_points: f64, max_points: usize) -> u64 {
    if !(total_points > max_points as f64) {
        return 1;
    }
    (total_points / max_points as f64).ceil() as u64
}

/// `volts = code * vdiv / 25 - offset`, codes being signed bytes.
pub fn codes_to_volts(codes: &[u8], vdiv: f64, offset: f64) -> Vec<f64> {
    codes
        .iter()
        .map(|&b| b as i8 as f64 * vdiv / CODES_PER_DIV - offset)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn code_conversion() {
        let volts = codes_to_volts(&[0, 25, 0xE7, 0x7F, 0x80], 0.5, 0.1);
        let expected = [-0.1, 0.4, -0.6, 127.0 * 0.02 - 0.1, -128.0 * 0.02 - 0.1];
        for (v, e) in volts.iter().zip(expected) {
            assert!((v - e).abs() < 1e-12, "{} != {}", v, e);
        }
    }

    #[test]
    fn sparsing_bounds_the_record() {
        assert_eq!(sparsing_for(1_000.0, 100_000), 1);
        assert_eq!(sparsing_for(100_000.0, 100_000), 1);
        assert_eq!(sparsing_for(1.4e7, 100_000), 140);
        assert_eq!(sparsing_for(150_001.0, 100_000), 2);
    }

    /// Minimal SDS stand-in: answers the queries `Sds` sends and serves a
    /// 1 kHz tone with a 2nd harmonic as `DAT2` data.
    fn spawn_fake_scope(codes: Vec<u8>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut seen = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                let cmd = line.trim().to_string();
                seen.push(cmd.clone());
                let reply: Vec<u8> = match cmd.as_str() {
                    "*IDN?" => b"Siglent Technologies,SDS1202X-E,SDS0000001,8.1.6.1.37R2\n".to_vec(),
                    "C1:VDIV?" => b"C1:VDIV 1.00E-01V\n".to_vec(),
                    "C1:OFST?" => b"C1:OFST 0.00E+00V\n".to_vec(),
                    "SARA?" => b"SARA 1.02E+05Sa/s\n".to_vec(),
                    "SANU? C1" => b"SANU 4.096E+03pts\n".to_vec(),
                    "C1:WF? DAT2" => {
                        let mut out = format!("C1:WF DAT2,#9{:09}", codes.len()).into_bytes();
                        out.extend_from_slice(&codes);
                        out.extend_from_slice(b"\n\n");
                        out
                    }
                    "C2:VDIV?" => b"C2:VDIV ???\n".to_vec(),
                    _ => Vec::new(),
                };
                if !reply.is_empty() {
                    writer.write_all(&reply).unwrap();
                }
            }
            seen
        });
        (port, handle)
    }

    fn tone_codes() -> Vec<u8> {
        // 102 kSa/s, 4096 points: 1000 Hz and 2000 Hz sit on exact-ish bins.
        (0..4096)
            .map(|i| {
                let t = i as f64 / 102_000.0;
                let v = 0.3 * (2.0 * PI * 1000.0 * t).sin() + 0.03 * (2.0 * PI * 2000.0 * t).sin();
                ((v / 0.1 * CODES_PER_DIV).round() as i8) as u8
            })
            .collect()
    }

    #[test]
    fn fetches_and_analyses_a_record() {
        let (port, server) = spawn_fake_scope(tone_codes());
        let settings = InstrumentSettings::default();
        let mut sds = Sds::connect("127.0.0.1", port, &settings).unwrap();

        let request = SnapshotRequest {
            channel: 0,
            fundamental_hz: 1000,
            max_freq_hz: 10_000,
            correct_peaks: true,
            min_level_db: -50,
        };
        let waveform = sds.fetch_waveform(0).unwrap();
        assert_eq!(waveform.samples.len(), 4096);
        assert!((waveform.sample_rate - 102_000.0).abs() < 1e-6);

        let snap = sds.fetch_snapshot(&request).unwrap();
        assert_eq!(snap.harmonic_bins().len(), 2);
        assert!((snap.thd_percent() - 10.0).abs() < 1.0, "thd {}", snap.thd_percent());
        drop(sds);

        let seen = server.join().unwrap();
        assert_eq!(seen[0], "*IDN?");
        assert!(seen.contains(&"WFSU SP,1,NP,100000,FP,0".to_string()));
    }

    #[test]
    fn malformed_reply_is_reported() {
        let (port, server) = spawn_fake_scope(Vec::new());
        let mut sds = Sds::connect("127.0.0.1", port, &InstrumentSettings::default()).unwrap();
        match sds.fetch_waveform(1) {
            Err(CommunicationError::Malformed { command, response }) => {
                assert_eq!(command, "C2:VDIV?");
                assert_eq!(response, "C2:VDIV ???");
            }
            other => panic!("expected malformed reply, got {:?}", other),
        }
        drop(sds);
        server.join().unwrap();
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        match Sds::connect("127.0.0.1", port, &InstrumentSettings::default()) {
            Err(CommunicationError::Connect { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{}", port)),
            Err(other) => panic!("expected connect error, got {:?}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
