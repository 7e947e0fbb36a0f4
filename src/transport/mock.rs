//! Scripted in-memory transport for driving sessions without hardware.
//!
//! Clones share state, so a test can keep a handle to queue lines and inspect
//! written commands after the transport has moved into a session or worker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{Link, Transport, TransportError};

#[derive(Debug)]
struct MockState {
    link: Link,
    incoming: VecDeque<Vec<u8>>,
    replies: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    written: Vec<Vec<u8>>,
    fail_next_write: bool,
    fail_next_read: bool,
}

/// Transport backed by queued response lines and per-command replies
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    name: String,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                link: Link::up(),
                incoming: VecDeque::new(),
                replies: HashMap::new(),
                written: Vec::new(),
                fail_next_write: false,
                fail_next_read: false,
            })),
            name: "mock".to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every write of `command` by queueing `lines`
    pub fn reply_to(self, command: &str, lines: &[&str]) -> Self {
        self.state().replies.insert(
            command.as_bytes().to_vec(),
            lines.iter().map(|l| l.as_bytes().to_vec()).collect(),
        );
        self
    }

    /// Queue one unsolicited response line
    pub fn push_line(&self, line: impl AsRef<[u8]>) {
        self.state().incoming.push_back(line.as_ref().to_vec());
    }

    pub fn push_lines<'a>(&self, lines: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state();
        state.incoming.extend(lines.into_iter().map(|l| l.as_bytes().to_vec()));
    }

    /// Commands written so far, as text
    pub fn written(&self) -> Vec<String> {
        self.state()
            .written
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    pub fn pending_lines(&self) -> usize {
        self.state().incoming.len()
    }

    /// Make the next write fail as if the cable was pulled
    pub fn inject_write_failure(&self) {
        self.state().fail_next_write = true;
    }

    /// Make the next read fail as if the cable was pulled
    pub fn inject_read_failure(&self) {
        self.state().fail_next_read = true;
    }

    fn unplugged() -> TransportError {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "mock device unplugged",
        ))
    }
}

impl Transport for MockTransport {
    fn write(&mut self, command: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        state.link.ensure_up()?;

        if std::mem::take(&mut state.fail_next_write) {
            return state.link.track(&self.name, Err(Self::unplugged()));
        }

        log::trace!("{} <- {}", self.name, String::from_utf8_lossy(command));
        state.written.push(command.to_vec());
        if let Some(lines) = state.replies.get(command).cloned() {
            state.incoming.extend(lines);
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state();
                state.link.ensure_up()?;
                if std::mem::take(&mut state.fail_next_read) {
                    return state.link.track(&self.name, Err(Self::unplugged()));
                }
                if let Some(line) = state.incoming.pop_front() {
                    return Ok(line);
                }
            }
            if start.elapsed() >= timeout {
                return Err(TransportError::Timeout {
                    waited: start.elapsed(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        state.link.ensure_up()?;
        let mut bytes = Vec::new();
        for line in state.incoming.drain(..) {
            bytes.extend_from_slice(&line);
            bytes.extend_from_slice(b"\r\n");
        }
        Ok(bytes)
    }

    fn is_connected(&self) -> bool {
        self.state().link.is_up()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reply_follows_write() {
        let mut mock = MockTransport::new().reply_to("ID", &["PSoC-Spectrometer"]);
        assert!(matches!(
            mock.read_line(Duration::from_millis(5)),
            Err(TransportError::Timeout { .. })
        ));
        mock.write(b"ID").unwrap();
        assert_eq!(mock.read_line(Duration::from_millis(5)).unwrap(), b"PSoC-Spectrometer");
        assert_eq!(mock.written(), vec!["ID".to_string()]);
    }

    #[test]
    fn test_clones_share_state() {
        let handle = MockTransport::new();
        let mut moved = handle.clone();
        handle.push_lines(["a", "b"]);
        assert_eq!(moved.read_line(Duration::ZERO).unwrap(), b"a");
        assert_eq!(handle.pending_lines(), 1);
        assert_eq!(moved.read_all_available().unwrap(), b"b\r\n");
    }

    #[test]
    fn test_injected_failure_drops_link() {
        let mut mock = MockTransport::new();
        mock.inject_write_failure();
        assert!(matches!(mock.write(b"ID"), Err(TransportError::Io(_))));
        assert!(!mock.is_connected());
        assert!(matches!(mock.write(b"ID"), Err(TransportError::NotConnected)));
        assert!(matches!(
            mock.read_line(Duration::ZERO),
            Err(TransportError::NotConnected)
        ));
    }
}
