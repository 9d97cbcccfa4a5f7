//! Dialplan application execution over `sendmsg`
//!
//! Executing an application is a two-step protocol: a `sendmsg … execute`
//! command acknowledged by a `command/reply`, then a correlated
//! `CHANNEL_EXECUTE_COMPLETE` event once the application finishes. The
//! correlation key is the `Event-UUID` supplied with the command, which
//! FreeSWITCH echoes back as `Application-UUID` - the channel UUID alone is
//! not enough because several applications may run on one channel
//! concurrently.

use std::fmt::Write;
use tracing::debug;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{validate_no_newlines, EslError, EslResult};
use crate::event::{BackgroundJobResult, EventMessage, EventName};

/// Optional `sendmsg` execute headers.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Emit `event-lock: true`: queue the application behind the channel's
    /// current event instead of interleaving.
    pub event_lock: bool,
    /// Emit `isAsync: true`: run the application without blocking the
    /// channel's event loop.
    ///
    /// The header spelling is kept verbatim for compatibility with the wire
    /// format this client has always produced; newer FreeSWITCH releases
    /// also accept `async: true`.
    pub is_async: bool,
    /// Emit `loops: N`: repeat the application N times.
    pub loops: Option<u32>,
}

/// Assemble the `sendmsg` wire form for an application execution.
///
/// Non-empty arguments travel as a length-framed `text/plain` payload inside
/// the sendmsg body, so they may contain anything including newlines.
fn execute_command(
    channel_uuid: &str,
    application: &str,
    args: Option<&str>,
    application_uuid: &str,
    options: &ExecuteOptions,
) -> EslResult<String> {
    validate_no_newlines(channel_uuid, "channel uuid")?;
    validate_no_newlines(application, "application name")?;

    let mut wire = format!("sendmsg {}\n", channel_uuid);
    let _ = write!(wire, "Event-UUID: {}\n", application_uuid);
    wire.push_str("call-command: execute\n");
    let _ = write!(wire, "execute-app-name: {}\n", application);
    if options.event_lock {
        wire.push_str("event-lock: true\n");
    }
    if let Some(loops) = options.loops {
        let _ = write!(wire, "loops: {}\n", loops);
    }
    if options.is_async {
        wire.push_str("isAsync: true\n");
    }
    match args {
        Some(args) if !args.is_empty() => {
            let _ = write!(
                wire,
                "content-type: text/plain\ncontent-length: {}\n\n{}\n\n",
                args.len(),
                args
            );
        }
        _ => wire.push('\n'),
    }
    Ok(wire)
}

impl Connection {
    /// Execute a dialplan application on a channel and await its completion
    /// event.
    ///
    /// Returns `Ok(None)` when the command is refused (no completion will
    /// ever arrive) or when the connection terminates before the completion
    /// event - neither is a transport error.
    pub async fn execute_application(
        &self,
        channel_uuid: &str,
        application: &str,
        args: Option<&str>,
    ) -> EslResult<Option<EventMessage>> {
        self.execute_application_with_options(
            channel_uuid,
            application,
            args,
            ExecuteOptions::default(),
        )
        .await
    }

    /// [`execute_application`](Self::execute_application) with explicit
    /// `event-lock` / `loops` / `isAsync` options.
    pub async fn execute_application_with_options(
        &self,
        channel_uuid: &str,
        application: &str,
        args: Option<&str>,
        options: ExecuteOptions,
    ) -> EslResult<Option<EventMessage>> {
        self.subscribe_events([EventName::ChannelExecuteComplete])
            .await?;

        let application_uuid = Uuid::new_v4().to_string();
        let completion = {
            let application_uuid = application_uuid.clone();
            self.first_event(move |event| {
                event.event_name() == EventName::ChannelExecuteComplete
                    && event.application_uuid() == Some(application_uuid.as_str())
            })
        };

        let wire = execute_command(channel_uuid, application, args, &application_uuid, &options)?;
        let reply = match self.send_command_wire(wire).await {
            Ok(reply) => reply,
            Err(EslError::Cancelled) | Err(EslError::Disposed) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !reply.success() {
            debug!(
                application,
                reply = ?reply.reply_text(),
                "execute refused; no completion will arrive"
            );
            return Ok(None);
        }

        Ok(completion.await)
    }

    /// Bridge the channel to a destination, resolving as soon as the
    /// outcome is known.
    ///
    /// A successful bridge emits no `CHANNEL_EXECUTE_COMPLETE` until the
    /// bridged leg finally hangs up, so the completion observer is raced
    /// against the first of `CHANNEL_BRIDGE` / `CHANNEL_HANGUP` on the
    /// A-leg; whichever event arrives first is returned. Inspect its
    /// [`event_name()`](EventMessage::event_name) (and
    /// [`hangup_cause()`](EventMessage::hangup_cause)) to distinguish a
    /// bridged call from a failed one. Both observers are armed before the
    /// command is written.
    pub async fn bridge(
        &self,
        channel_uuid: &str,
        destination: &str,
    ) -> EslResult<Option<EventMessage>> {
        self.subscribe_events([
            EventName::ChannelExecuteComplete,
            EventName::ChannelBridge,
            EventName::ChannelHangup,
        ])
        .await?;

        let application_uuid = Uuid::new_v4().to_string();
        let completion = {
            let application_uuid = application_uuid.clone();
            self.first_event(move |event| {
                event.event_name() == EventName::ChannelExecuteComplete
                    && event.application_uuid() == Some(application_uuid.as_str())
            })
        };
        let a_leg = {
            let channel_uuid = channel_uuid.to_string();
            self.first_event(move |event| {
                matches!(
                    event.event_name(),
                    EventName::ChannelBridge | EventName::ChannelHangup
                ) && event.unique_id() == Some(channel_uuid.as_str())
            })
        };

        let wire = execute_command(
            channel_uuid,
            "bridge",
            Some(destination),
            &application_uuid,
            &ExecuteOptions::default(),
        )?;
        let reply = match self.send_command_wire(wire).await {
            Ok(reply) => reply,
            Err(EslError::Cancelled) | Err(EslError::Disposed) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !reply.success() {
            debug!(reply = ?reply.reply_text(), "bridge refused");
            return Ok(None);
        }

        let outcome = tokio::select! {
            event = completion => event,
            event = a_leg => event,
        };
        Ok(outcome)
    }

    /// Run an API command in the background and await its result.
    ///
    /// The `Job-UUID` is generated client-side and passed with the `bgapi`
    /// command, so the result observer is armed before the job can finish.
    /// Fails with [`EslError::Cancelled`] when the connection terminates
    /// before the `BACKGROUND_JOB` event arrives.
    pub async fn background_job(
        &self,
        command: &str,
        arg: Option<&str>,
    ) -> EslResult<BackgroundJobResult> {
        validate_no_newlines(command, "bgapi command")?;
        if let Some(arg) = arg {
            validate_no_newlines(arg, "bgapi argument")?;
        }
        self.subscribe_events([EventName::BackgroundJob]).await?;

        let job_uuid = Uuid::new_v4().to_string();
        let result = {
            let job_uuid = job_uuid.clone();
            self.first_event(move |event| {
                event.event_name() == EventName::BackgroundJob
                    && event.job_uuid() == Some(job_uuid.as_str())
            })
        };

        let wire = match arg {
            Some(arg) => format!("bgapi {} {}\nJob-UUID: {}\n\n", command, arg, job_uuid),
            None => format!("bgapi {}\nJob-UUID: {}\n\n", command, job_uuid),
        };
        let reply = self.send_command_wire(wire).await?;
        if !reply.success() {
            return Err(EslError::CommandFailed {
                reply_text: reply.reply_text().unwrap_or("-ERR").to_string(),
            });
        }

        match result.await {
            Some(event) => Ok(BackgroundJobResult::from_event(&event)),
            None => Err(EslError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_wire_format_with_args() {
        let wire = execute_command(
            "UUID",
            "playback",
            Some("file.wav"),
            "A",
            &ExecuteOptions::default(),
        )
        .unwrap();
        assert_eq!(
            wire,
            "sendmsg UUID\nEvent-UUID: A\ncall-command: execute\nexecute-app-name: playback\ncontent-type: text/plain\ncontent-length: 8\n\nfile.wav\n\n"
        );
    }

    #[test]
    fn execute_wire_format_without_args() {
        let wire =
            execute_command("UUID", "answer", None, "A", &ExecuteOptions::default()).unwrap();
        assert_eq!(
            wire,
            "sendmsg UUID\nEvent-UUID: A\ncall-command: execute\nexecute-app-name: answer\n\n"
        );
    }

    #[test]
    fn execute_wire_format_empty_args_has_no_body() {
        let wire =
            execute_command("UUID", "answer", Some(""), "A", &ExecuteOptions::default()).unwrap();
        assert!(wire.ends_with("execute-app-name: answer\n\n"));
        assert!(!wire.contains("content-type"));
    }

    #[test]
    fn execute_wire_format_all_options() {
        let options = ExecuteOptions {
            event_lock: true,
            is_async: true,
            loops: Some(3),
        };
        let wire = execute_command("UUID", "playback", Some("x.wav"), "A", &options).unwrap();
        assert_eq!(
            wire,
            "sendmsg UUID\nEvent-UUID: A\ncall-command: execute\nexecute-app-name: playback\nevent-lock: true\nloops: 3\nisAsync: true\ncontent-type: text/plain\ncontent-length: 5\n\nx.wav\n\n"
        );
    }

    #[test]
    fn execute_rejects_newlines_in_uuid() {
        let result = execute_command(
            "UUID\nexit",
            "answer",
            None,
            "A",
            &ExecuteOptions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn args_may_contain_newlines() {
        // Length-framed payloads carry anything.
        let wire = execute_command(
            "UUID",
            "set",
            Some("a=1\nb=2"),
            "A",
            &ExecuteOptions::default(),
        )
        .unwrap();
        assert!(wire.contains("content-length: 7\n\na=1\nb=2\n\n"));
    }
}
