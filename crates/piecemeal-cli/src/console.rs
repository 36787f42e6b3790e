use piecemeal_engine::{
    ChannelError, DropAnnouncement, DropChannel, MessageHandle, RewardError, RewardGranter,
};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Line-delimited JSON output shared by every console collaborator.
#[derive(Clone)]
pub struct EventSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventSink {
    pub fn stdout() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn emit<T: Serialize>(&self, event: &T) -> io::Result<()> {
        let line = serde_json::to_string(event).map_err(io::Error::other)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()
    }

    /// Emits, logging instead of failing. For events nobody can act on.
    pub fn emit_or_log<T: Serialize>(&self, event: &T) {
        if let Err(err) = self.emit(event) {
            warn!(event = "emit_failed", error = %err);
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ConsoleEvent<'a> {
    Announce {
        message_id: &'a str,
        content: String,
        #[serde(flatten)]
        announcement: &'a DropAnnouncement,
    },
    Edit {
        channel_id: &'a str,
        message_id: &'a str,
        content: &'a str,
    },
    Reward {
        user_id: &'a str,
        slug: &'a str,
        reward_ref: &'a str,
    },
}

/// Stands in for the chat platform: announcements and edits become JSON lines.
pub struct ConsoleChannel {
    sink: EventSink,
    next_id: AtomicU64,
}

impl ConsoleChannel {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            next_id: AtomicU64::new(1),
        }
    }
}

impl DropChannel for ConsoleChannel {
    fn announce(&self, announcement: &DropAnnouncement) -> Result<MessageHandle, ChannelError> {
        let message_id = format!(
            "{}-{}",
            announcement.channel_id,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        self.sink
            .emit(&ConsoleEvent::Announce {
                message_id: &message_id,
                content: announcement.content(),
                announcement,
            })
            .map_err(|err| ChannelError::new(&announcement.channel_id, err.to_string()))?;
        Ok(MessageHandle {
            channel_id: announcement.channel_id.clone(),
            message_id,
        })
    }

    fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), ChannelError> {
        self.sink
            .emit(&ConsoleEvent::Edit {
                channel_id: &handle.channel_id,
                message_id: &handle.message_id,
                content,
            })
            .map_err(|err| ChannelError::new(&handle.channel_id, err.to_string()))
    }
}

/// Grants rewards by reporting them on the event feed.
pub struct ConsoleRewards {
    sink: EventSink,
}

impl ConsoleRewards {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }
}

impl RewardGranter for ConsoleRewards {
    fn grant(&self, user_id: &str, slug: &str, reward_ref: &str) -> Result<(), RewardError> {
        self.sink
            .emit(&ConsoleEvent::Reward {
                user_id,
                slug,
                reward_ref,
            })
            .map_err(|err| RewardError::new(reward_ref, err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Writer whose contents tests can read back.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().expect("buffer lock").clone();
            String::from_utf8(bytes)
                .expect("utf8 output")
                .lines()
                .map(|line| serde_json::from_str(line).expect("json line"))
                .collect()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
