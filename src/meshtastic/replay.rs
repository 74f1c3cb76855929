//! JSON-lines replay adapter.
//!
//! Each non-empty line is one raw packet in the client-library JSON shape
//! (see [`RawPacket`]). Lines starting with `#` are comments. End of file ends
//! the event stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, watch};

use super::packet::RawPacket;
use super::{CaptureClock, DeviceEvent, DeviceInfo, DeviceSource, LinkState};

pub struct ReplaySource {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
}

impl ReplaySource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lines: None,
        }
    }
}

/// Parse one capture line. Returns `None` for blank and comment lines.
pub fn parse_line(line: &str) -> Option<Result<RawPacket, serde_json::Error>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str::<RawPacket>(trimmed).map(|mut packet| {
        if packet.encoded_len.is_none() {
            packet.encoded_len = u32::try_from(trimmed.len()).ok();
        }
        packet
    }))
}

#[async_trait]
impl DeviceSource for ReplaySource {
    fn describe(&self) -> String {
        format!("replay {}", self.path.display())
    }

    async fn open(&mut self) -> Result<DeviceInfo> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open capture file {}", self.path.display()))?;
        self.lines = Some(BufReader::new(file).lines());
        Ok(DeviceInfo {
            my_node_num: None,
            long_name: Some(self.describe()),
            node_count: 0,
        })
    }

    async fn run(
        mut self: Box<Self>,
        events: mpsc::Sender<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(mut lines) = self.lines.take() else {
            anyhow::bail!("replay source used before open()");
        };
        let mut line_no = 0usize;
        let mut sent = 0usize;
        let mut skipped = 0usize;
        let mut clock = CaptureClock::new();

        loop {
            let line = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Replay interrupted after {} packets", sent);
                        return Ok(());
                    }
                    continue;
                }
                line = lines.next_line() => line
                    .with_context(|| format!("Failed reading {}", self.path.display()))?,
            };
            let Some(line) = line else { break };
            line_no += 1;
            match parse_line(&line) {
                None => {}
                Some(Ok(packet)) => {
                    if events.send(DeviceEvent::packet(packet, &mut clock)).await.is_err() {
                        return Ok(());
                    }
                    sent += 1;
                }
                Some(Err(e)) => {
                    skipped += 1;
                    warn!(
                        "{}:{}: skipping unparseable line: {}",
                        self.path.display(),
                        line_no,
                        e
                    );
                }
            }
        }

        info!(
            "Replay of {} finished: {} packets, {} unparseable lines",
            self.path.display(),
            sent,
            skipped
        );
        let _ = events
            .send(DeviceEvent::Link(LinkState::Down("end of input".into())))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn comment_and_blank_lines_are_skipped() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("# captured 2024-05-01").is_none());
        assert!(parse_line("{not json").unwrap().is_err());
    }

    #[test]
    fn line_length_becomes_encoded_len() {
        let line = r#"{"fromId":"!00000001"}"#;
        let packet = parse_line(line).unwrap().unwrap();
        assert_eq!(packet.encoded_len, Some(line.len() as u32));
        let explicit = parse_line(r#"{"fromId":"!00000001","encodedLen":12}"#)
            .unwrap()
            .unwrap();
        assert_eq!(explicit.encoded_len, Some(12));
    }

    #[tokio::test]
    async fn streams_file_then_reports_end() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"fromId":"!00000001","decoded":{{"portnum":"TEXT_MESSAGE_APP"}}}}"#
        )
        .unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, r#"{{"fromId":"!00000002"}}"#).unwrap();

        let mut source = ReplaySource::new(file.path());
        source.open().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        Box::new(source).run(tx, stop_rx).await.unwrap();

        let mut packets = 0;
        let mut ended = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                DeviceEvent::Packet { .. } => packets += 1,
                DeviceEvent::Link(LinkState::Down(_)) => ended = true,
                DeviceEvent::Link(LinkState::Up(_)) => {}
            }
        }
        assert_eq!(packets, 2);
        assert!(ended);
    }

    #[tokio::test]
    async fn missing_file_fails_open() {
        let mut source = ReplaySource::new("/nonexistent/capture.jsonl");
        assert!(source.open().await.is_err());
    }
}
