//! The session channel: window accounting, line editing and command execution.
//!
//! A connection carries at most one [`Channel`]. Outbound data goes through
//! [`Channel::send_data`], which keeps the tracked peer window from going
//! negative: when a frame is larger than the window, a WINDOW_ADJUST is sent
//! first and the tracked window is credited by the policy's increment.
//!
//! Commands run through an [`Executor`]. The channel feeds it the command
//! line on stdin and forwards what it wrote, stderr first.

use crate::ssh::connection::{
    channel_message, data_message, extended_data_message, window_adjust_message,
    ChannelOpenConfirmation, ChannelRequest, ChannelRequestType, EXTENDED_DATA_STDERR,
};
use crate::ssh::dispatcher::Dispatcher;
use crate::ssh::message::MessageType;
use keel_platform::{KeelError, KeelResult};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use tracing::{debug, trace, warn};

/// Window and packet size policy for channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Receive window advertised on open
    pub initial_window: u32,
    /// Maximum packet size advertised on open
    pub max_packet: u32,
    /// Increment of the WINDOW_ADJUST sent ahead of a frame larger than the peer window
    pub adjust_increment: u32,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            initial_window: 0x7fff_ffff,
            max_packet: 1_048_576,
            adjust_increment: 0x7fff_ffff,
        }
    }
}

/// Runs commands for `exec` and `shell` requests.
pub trait Executor: Send + Sync {
    /// Runs `argv` to completion and returns its exit status.
    fn execute(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> KeelResult<i32>;
}

/// Output of one executed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status
    pub status: i32,
    /// Standard output, LF converted to CR LF
    pub stdout: Vec<u8>,
    /// Standard error, LF converted to CR LF
    pub stderr: Vec<u8>,
}

/// Runs one command line through `sh`, with the line as its stdin.
pub fn run_command(
    executor: &dyn Executor,
    command: &str,
    env: &BTreeMap<String, String>,
) -> KeelResult<CommandOutput> {
    let argv = vec!["sh".to_string()];
    let mut stdin = command.as_bytes();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let status = executor.execute(&argv, env, &mut stdin, &mut stdout, &mut stderr)?;
    debug!(command, status, "command finished");

    Ok(CommandOutput {
        status,
        stdout: to_crlf(&stdout),
        stderr: to_crlf(&stderr),
    })
}

/// Converts every LF to CR LF.
pub fn to_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &b in data {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

/// State of the open session channel.
#[derive(Debug, Clone)]
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    /// Bytes the peer will still accept. Kept wider than u32 so credits
    /// never overflow.
    peer_window: u64,
    peer_max_packet: u32,
    local_window: u64,
    /// Bytes taken from `input` and not yet granted back to the peer.
    consumed: u64,
    policy: WindowPolicy,
    eof_received: bool,
    eof_sent: bool,
    close_sent: bool,
    /// Set once `exec` or `shell` started; a channel runs one program.
    program_started: bool,
    env: BTreeMap<String, String>,
    input: VecDeque<u8>,
}

impl Channel {
    /// Creates the channel for an accepted open.
    pub fn new(
        local_id: u32,
        remote_id: u32,
        peer_window: u32,
        peer_max_packet: u32,
        policy: WindowPolicy,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            peer_window: u64::from(peer_window),
            peer_max_packet,
            local_window: u64::from(policy.initial_window),
            consumed: 0,
            policy,
            eof_received: false,
            eof_sent: false,
            close_sent: false,
            program_started: false,
            env: BTreeMap::new(),
            input: VecDeque::new(),
        }
    }

    /// Returns the local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the peer's channel id.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the tracked peer window.
    pub fn peer_window(&self) -> u64 {
        self.peer_window
    }

    /// Returns the peer's maximum packet size.
    pub fn peer_max_packet(&self) -> u32 {
        self.peer_max_packet
    }

    /// Returns the channel environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Returns true once the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Returns true once CHANNEL_CLOSE was sent.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Claims the channel for an `exec` or `shell` request.
    ///
    /// Returns false if a program already runs or ran on this channel.
    pub fn start_program(&mut self) -> bool {
        !std::mem::replace(&mut self.program_started, true)
    }

    /// The open confirmation advertising the local policy.
    pub fn confirmation(&self) -> ChannelOpenConfirmation {
        ChannelOpenConfirmation {
            recipient_channel: self.remote_id,
            sender_channel: self.local_id,
            initial_window_size: self.policy.initial_window,
            maximum_packet_size: self.policy.max_packet,
        }
    }

    /// Credits the peer window from an inbound WINDOW_ADJUST.
    pub fn credit(&mut self, bytes_to_add: u32) {
        self.peer_window += u64::from(bytes_to_add);
        trace!(channel = self.local_id, window = self.peer_window, "peer window credited");
    }

    /// Records `pty-req` and `env` data in the channel environment.
    ///
    /// Returns false for requests that carry no environment.
    pub fn record_environment(&mut self, request: &ChannelRequest) -> bool {
        match request.request_type() {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                ..
            } => {
                self.env.insert("TERM".to_string(), term.clone());
                self.env.insert("COLUMNS".to_string(), width_chars.to_string());
                self.env.insert("LINES".to_string(), height_rows.to_string());
                self.env.insert("WIDTH".to_string(), width_pixels.to_string());
                self.env.insert("HEIGHT".to_string(), height_pixels.to_string());
                true
            }
            ChannelRequestType::Env { name, value } => {
                self.env.insert(name.clone(), value.clone());
                true
            }
            _ => false,
        }
    }

    /// Buffers inbound data and charges it to the local window.
    ///
    /// Data after EOF or CLOSE is discarded, as is anything beyond the
    /// advertised window, so the buffer never exceeds the window.
    pub fn receive_data(&mut self, data: &[u8]) {
        if self.eof_received || self.close_sent {
            debug!(channel = self.local_id, len = data.len(), "data after eof or close dropped");
            return;
        }
        let accepted = data
            .len()
            .min(usize::try_from(self.local_window).unwrap_or(usize::MAX));
        if accepted < data.len() {
            warn!(
                channel = self.local_id,
                excess = data.len() - accepted,
                "peer exceeded window, data dropped"
            );
        }
        self.input.extend(&data[..accepted]);
        self.local_window -= accepted as u64;
    }

    /// Takes the next buffered input byte.
    pub fn next_input(&mut self) -> Option<u8> {
        let byte = self.input.pop_front()?;
        self.consumed += 1;
        Some(byte)
    }

    /// Returns the number of buffered input bytes.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    /// Returns the window still granted to the peer.
    pub fn local_window(&self) -> u64 {
        self.local_window
    }

    /// Grants the peer the bytes consumed so far once the window drops
    /// below half its initial size.
    pub fn replenish_window<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
    ) -> KeelResult<()> {
        if self.consumed == 0
            || self.close_sent
            || self.local_window >= u64::from(self.policy.initial_window / 2)
        {
            return Ok(());
        }
        let grant = self.consumed.min(u64::from(u32::MAX)) as u32;
        dispatcher.send(&window_adjust_message(self.remote_id, grant))?;
        self.consumed -= u64::from(grant);
        self.local_window += u64::from(grant);
        trace!(channel = self.local_id, window = self.local_window, "local window granted");
        Ok(())
    }

    /// Records the peer's EOF.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
    }

    /// Sends data to the peer.
    pub fn send_data<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        data: &[u8],
    ) -> KeelResult<()> {
        self.send_frames(dispatcher, data, None)
    }

    /// Sends stderr data to the peer.
    pub fn send_stderr<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        data: &[u8],
    ) -> KeelResult<()> {
        self.send_frames(dispatcher, data, Some(EXTENDED_DATA_STDERR))
    }

    fn send_frames<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        data: &[u8],
        data_type: Option<u32>,
    ) -> KeelResult<()> {
        if self.close_sent {
            return Err(KeelError::Protocol(format!(
                "Channel {} is closed",
                self.local_id
            )));
        }

        let chunk_size = self.peer_max_packet.max(1) as usize;
        for chunk in data.chunks(chunk_size) {
            let len = chunk.len() as u64;
            if self.peer_window < len {
                dispatcher.send(&window_adjust_message(
                    self.remote_id,
                    self.policy.adjust_increment,
                ))?;
                self.peer_window += u64::from(self.policy.adjust_increment);
                debug!(channel = self.local_id, window = self.peer_window, "window adjusted");
            }
            self.peer_window -= len;

            let payload = match data_type {
                Some(code) => extended_data_message(self.remote_id, code, chunk),
                None => data_message(self.remote_id, chunk),
            };
            dispatcher.send(&payload)?;
        }
        Ok(())
    }

    /// Sends an `exit-status` request.
    pub fn send_exit_status<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        status: i32,
    ) -> KeelResult<()> {
        let request = ChannelRequest::new(
            self.remote_id,
            ChannelRequestType::ExitStatus {
                exit_status: status as u32,
            },
            false,
        );
        dispatcher.send(&request.to_bytes())
    }

    /// Sends CHANNEL_EOF once.
    pub fn send_eof<R: Read, W: Write>(&mut self, dispatcher: &mut Dispatcher<R, W>) -> KeelResult<()> {
        if self.eof_sent || self.close_sent {
            return Ok(());
        }
        self.eof_sent = true;
        dispatcher.send(&channel_message(MessageType::ChannelEof, self.remote_id))
    }

    /// Sends CHANNEL_CLOSE once.
    pub fn send_close<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
    ) -> KeelResult<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        debug!(channel = self.local_id, "closing channel");
        dispatcher.send(&channel_message(MessageType::ChannelClose, self.remote_id))
    }

    /// Forwards command output, stderr first.
    pub fn forward_output<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        output: &CommandOutput,
    ) -> KeelResult<()> {
        if !output.stderr.is_empty() {
            self.send_stderr(dispatcher, &output.stderr)?;
        }
        if !output.stdout.is_empty() {
            self.send_data(dispatcher, &output.stdout)?;
        }
        Ok(())
    }
}

/// What the terminal should do after one input byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Nothing to send
    Nothing,
    /// Echo these bytes
    Echo(Vec<u8>),
    /// CR LF was echoed; run the completed line (may be empty) and re-prompt
    Line(String),
    /// Ctrl-C or Ctrl-D: close the channel
    Close,
}

/// Local line editing for an interactive shell.
#[derive(Debug, Clone, Default)]
pub struct LineEditor {
    line: Vec<u8>,
}

impl LineEditor {
    /// Creates an empty editor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the line typed so far.
    pub fn pending(&self) -> &[u8] {
        &self.line
    }

    /// Feeds one input byte.
    pub fn feed(&mut self, byte: u8) -> LineEvent {
        match byte {
            0x03 | 0x04 => LineEvent::Close,
            0x08 | 0x7f => {
                if self.line.pop().is_some() {
                    LineEvent::Echo(b"\x08 \x08".to_vec())
                } else {
                    LineEvent::Nothing
                }
            }
            b'\r' => {
                let line = std::mem::take(&mut self.line);
                LineEvent::Line(String::from_utf8_lossy(&line).into_owned())
            }
            0x1b => LineEvent::Nothing,
            _ => {
                self.line.push(byte);
                LineEvent::Echo(vec![byte])
            }
        }
    }
}
