use crate::app::{progress_file_name, App};
use anyhow::Result;
use chrono::{DateTime, Utc};
use piecemeal_engine::{ClaimReceipt, SessionError, SessionSummary, TickReport};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One inbound line from the platform feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message {
        channel_id: String,
        user_id: String,
        bot: bool,
    },
    Claim {
        session_id: Uuid,
        user_id: String,
    },
    Expire {
        session_id: Uuid,
    },
    Progress {
        user_id: String,
        slug: String,
    },
    Tick,
}

/// Blank lines and `#` comments parse to `None`.
pub fn parse_line(line: &str) -> Result<Option<Inbound>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let inbound = match parts.as_slice() {
        ["message", channel, user] => Inbound::Message {
            channel_id: channel.to_string(),
            user_id: user.to_string(),
            bot: false,
        },
        ["message", channel, user, "bot"] => Inbound::Message {
            channel_id: channel.to_string(),
            user_id: user.to_string(),
            bot: true,
        },
        ["claim", session, user] => Inbound::Claim {
            session_id: parse_session(session)?,
            user_id: user.to_string(),
        },
        ["expire", session] => Inbound::Expire {
            session_id: parse_session(session)?,
        },
        ["progress", user, slug] => Inbound::Progress {
            user_id: user.to_string(),
            slug: slug.to_string(),
        },
        ["tick"] => Inbound::Tick,
        [command, ..] => return Err(format!("unrecognized input: {command}")),
        [] => return Ok(None),
    };
    Ok(Some(inbound))
}

fn parse_session(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw).map_err(|err| format!("invalid session id {raw}: {err}"))
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServeEvent<'a> {
    Claimed {
        session_id: Uuid,
        user_id: &'a str,
        #[serde(flatten)]
        receipt: &'a ClaimReceipt,
    },
    ClaimRejected {
        session_id: Uuid,
        user_id: &'a str,
        reason: String,
    },
    UnknownSession {
        session_id: Uuid,
    },
    Progress {
        user_id: &'a str,
        slug: &'a str,
        label: &'a str,
        path: PathBuf,
    },
    Tick {
        #[serde(flatten)]
        report: &'a TickReport,
    },
    InputError {
        reason: String,
    },
}

/// Applies one inbound event. Failures are reported on the feed or logged, never
/// returned, so one bad event cannot stop the loop.
pub fn handle(app: &App, inbound: Inbound, now: DateTime<Utc>) {
    match inbound {
        Inbound::Message {
            channel_id,
            user_id,
            bot,
        } => handle_message(app, &channel_id, &user_id, bot, now),
        Inbound::Claim {
            session_id,
            user_id,
        } => handle_claim(app, session_id, &user_id, now),
        Inbound::Expire { session_id } => match app.drops.force_expire(&session_id) {
            Some(summary) => publish(app, &summary),
            None => app.sink.emit_or_log(&ServeEvent::UnknownSession { session_id }),
        },
        Inbound::Progress { user_id, slug } => handle_progress(app, &user_id, &slug),
        Inbound::Tick => run_tick(app, now),
    }
}

fn handle_message(app: &App, channel_id: &str, user_id: &str, bot: bool, now: DateTime<Utc>) {
    match app.scheduler.record_message(channel_id, bot) {
        Ok(true) => {
            if let Err(err) = app.scheduler.spawn_if_due(channel_id, now) {
                warn!(event = "spawn_skipped", channel_id, error = %err);
            }
        }
        Ok(false) => {}
        Err(err) => warn!(event = "message_not_counted", channel_id, user_id, error = %err),
    }
}

fn handle_claim(app: &App, session_id: Uuid, user_id: &str, now: DateTime<Utc>) {
    let Some(session) = app.drops.get(&session_id) else {
        app.sink.emit_or_log(&ServeEvent::UnknownSession { session_id });
        return;
    };
    match session.attempt_claim(user_id, now, &app.ledger, &app.detector) {
        Ok(mut receipt) => {
            if receipt.newly_added {
                app.forget_render(user_id, session.slug());
            }
            if receipt.completion_error.is_some() {
                match app.admin.check_completion(user_id, session.slug(), now) {
                    Ok(outcome) => {
                        receipt.completion = Some(outcome);
                        receipt.completion_error = None;
                    }
                    Err(err) => warn!(
                        event = "completion_check_deferred",
                        session_id = %session_id,
                        user_id,
                        error = %err
                    ),
                }
            }
            app.sink.emit_or_log(&ServeEvent::Claimed {
                session_id,
                user_id,
                receipt: &receipt,
            });
            if let Some(summary) = &receipt.finalized {
                publish(app, summary);
            }
        }
        Err(SessionError::Rejected(reason)) => {
            app.sink.emit_or_log(&ServeEvent::ClaimRejected {
                session_id,
                user_id,
                reason: reason.to_string(),
            });
        }
        Err(SessionError::Storage(err)) => {
            error!(event = "claim_not_saved", session_id = %session_id, user_id, error = %err);
            app.sink.emit_or_log(&ServeEvent::ClaimRejected {
                session_id,
                user_id,
                reason: "your claim could not be saved, please try again".to_string(),
            });
        }
    }
}

fn handle_progress(app: &App, user_id: &str, slug: &str) {
    let result = progress_file_name(slug, user_id).and_then(|file_name| {
        let rendered = app.render_progress(user_id, slug)?;
        let path = app.write_render(&rendered, None, &file_name)?;
        Ok((rendered, path))
    });
    match result {
        Ok((rendered, path)) => app.sink.emit_or_log(&ServeEvent::Progress {
            user_id,
            slug,
            label: &rendered.label,
            path,
        }),
        Err(err) => app.sink.emit_or_log(&ServeEvent::InputError {
            reason: format!("progress for {user_id} on {slug}: {err:#}"),
        }),
    }
}

pub fn run_tick(app: &App, now: DateTime<Utc>) {
    let report = app.scheduler.tick(now);
    if !report.spawned.is_empty() || !report.skipped.is_empty() {
        app.sink.emit_or_log(&ServeEvent::Tick { report: &report });
    }
    for summary in app.drops.reap(now) {
        publish(app, &summary);
    }
}

fn publish(app: &App, summary: &SessionSummary) {
    if let Err(err) = summary.publish(app.channel.as_ref()) {
        warn!(event = "summary_not_published", session_id = %summary.session_id, error = %err);
    }
}

/// Drives ticks and the stdin feed until ctrl-c. Ticks keep running after stdin closes.
pub async fn run(app: &App, tick_interval: Duration) -> Result<()> {
    info!(
        event = "serve_start",
        data_path = %app.settings.data_path.display(),
        tick_secs = tick_interval.as_secs()
    );
    let mut ticker = tokio::time::interval(tick_interval);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_tick(app, Utc::now()),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(inbound)) => handle(app, inbound, Utc::now()),
                    Ok(None) => {}
                    Err(reason) => app.sink.emit_or_log(&ServeEvent::InputError { reason }),
                },
                Ok(None) => {
                    info!(event = "stdin_closed");
                    stdin_open = false;
                }
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    stdin_open = false;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    let expired = app.drops.reap(DateTime::<Utc>::MAX_UTC);
    for summary in &expired {
        publish(app, summary);
    }
    if let Err(err) = app.store.flush() {
        warn!(event = "final_flush_failed", error = %err);
    }
    info!(event = "serve_stop", expired = expired.len());
    Ok(())
}
