//! SSH server session.
//!
//! [`Server::serve`] runs one connection to completion on the calling
//! thread:
//!
//! 1. identification exchange
//! 2. key exchange (server role)
//! 3. the main loop: wait for input, flush while idle, dispatch packets
//!
//! Authentication is accepted only after the client asked for the
//! `ssh-userauth` service, and channel messages only after authentication.
//! Every fatal error is announced with a DISCONNECT before the session ends.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::authorized_keys::DirectoryKeyStore;
//! use keel_proto::ssh::channel::Executor;
//! use keel_proto::ssh::hostkey::{load_host_key, HostKeys};
//! use keel_proto::ssh::server::{Server, ServerConfig};
//! use std::net::TcpListener;
//! use std::sync::Arc;
//!
//! # fn run(executor: Arc<dyn Executor>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut host_keys = HostKeys::new();
//! host_keys.add(load_host_key(&std::fs::read_to_string("/etc/keel/host_rsa.pem")?)?);
//!
//! let server = Server::new(
//!     ServerConfig::default(),
//!     host_keys,
//!     Arc::new(DirectoryKeyStore::new("/etc/keel/users")),
//!     executor,
//! )?;
//!
//! let listener = TcpListener::bind("127.0.0.1:2222")?;
//! let (stream, _) = listener.accept()?;
//! server.serve(stream.try_clone()?, stream)?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::Authenticator;
use crate::ssh::authorized_keys::AuthorizedKeyStore;
use crate::ssh::channel::{
    run_command, Channel, CommandOutput, Executor, LineEditor, LineEvent, WindowPolicy,
};
use crate::ssh::connection::{
    channel_message, open_failure_message, parse_data, parse_window_adjust, recipient_channel,
    ChannelOpen, ChannelOpenFailureReason, ChannelRequest, ChannelRequestType,
};
use crate::ssh::crypto::Capabilities;
use crate::ssh::dispatcher::{Dispatcher, Handler, Route};
use crate::ssh::hostkey::HostKeys;
use crate::ssh::kex::{parse_disconnect, KeyExchange};
use crate::ssh::message::MessageType;
use crate::ssh::packet::PacketProtocol;
use crate::ssh::transport::WaitReadable;
use crate::ssh::version::{read_identification, write_identification, Version};
use crate::ssh::wire::{Reader, Writer};
use keel_platform::error::{
    DISCONNECT_BY_APPLICATION, DISCONNECT_KEY_EXCHANGE_FAILED, DISCONNECT_PROTOCOL_ERROR,
    DISCONNECT_SERVICE_NOT_AVAILABLE,
};
use keel_platform::{KeelError, KeelResult};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The service clients must request before authenticating.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Exit status reported when the executor itself fails.
const EXECUTOR_FAILURE_STATUS: i32 = 127;

/// Messages accepted once the user is authenticated.
const CHANNEL_ROUTES: [(MessageType, Route); 7] = [
    (MessageType::ChannelOpen, Route::Handle),
    (MessageType::ChannelWindowAdjust, Route::Handle),
    (MessageType::ChannelData, Route::Handle),
    (MessageType::ChannelExtendedData, Route::Ignore),
    (MessageType::ChannelEof, Route::Handle),
    (MessageType::ChannelClose, Route::Handle),
    (MessageType::ChannelRequest, Route::Handle),
];

/// SSH server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Software part of the identification string.
    pub identification: String,
    /// How long the main loop waits for input before flushing output.
    pub poll_interval: Duration,
    /// Channel window policy.
    pub window: WindowPolicy,
    /// Shell prompt.
    pub prompt: String,
    /// Offered algorithms.
    pub capabilities: Arc<Capabilities>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identification: Version::default_keel().software().to_string(),
            poll_interval: Duration::from_secs(5),
            window: WindowPolicy::default(),
            prompt: "$ ".to_string(),
            capabilities: Arc::new(Capabilities::default()),
        }
    }
}

/// SSH_MSG_DISCONNECT payload.
pub fn disconnect_message(reason: u32, description: &str) -> Vec<u8> {
    let mut w = Writer::message(MessageType::Disconnect);
    w.uint32(reason).string(description).string("");
    w.into_vec()
}

/// Sends a DISCONNECT, ignoring write failures, and returns the matching
/// [`KeelError::Disconnected`].
fn disconnect<R: Read, W: Write>(
    protocol: &mut PacketProtocol<R, W>,
    reason: u32,
    description: &str,
) -> KeelError {
    info!(reason, description, "disconnecting");
    if let Err(e) = protocol.send(&disconnect_message(reason, description)) {
        debug!(error = %e, "disconnect not delivered");
    }
    KeelError::Disconnected {
        reason,
        description: description.to_string(),
    }
}

/// Shared server state; serves any number of connections.
pub struct Server {
    config: Arc<ServerConfig>,
    host_keys: Arc<HostKeys>,
    key_store: Arc<dyn AuthorizedKeyStore>,
    executor: Arc<dyn Executor>,
}

impl Server {
    /// Creates a server.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] if no host key is loaded.
    pub fn new(
        config: ServerConfig,
        host_keys: HostKeys,
        key_store: Arc<dyn AuthorizedKeyStore>,
        executor: Arc<dyn Executor>,
    ) -> KeelResult<Self> {
        if host_keys.is_empty() {
            return Err(KeelError::Config("At least one host key is required".to_string()));
        }
        Ok(Self {
            config: Arc::new(config),
            host_keys: Arc::new(host_keys),
            key_store,
            executor,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs one connection until it ends.
    ///
    /// Returns `Ok(())` when the session ends with a DISCONNECT from
    /// either side.
    pub fn serve<R: Read + WaitReadable, W: Write>(&self, input: R, output: W) -> KeelResult<()> {
        let mut protocol = PacketProtocol::new(input, output, Arc::clone(&self.config.capabilities));

        let version = Version::new(&self.config.identification, None);
        write_identification(protocol.output_mut(), &version)?;

        let client_id = match read_identification(protocol.input_mut()) {
            Ok(id) => id,
            Err(KeelError::Protocol(msg)) => {
                warn!(error = %msg, "bad client identification");
                disconnect(&mut protocol, DISCONNECT_PROTOCOL_ERROR, "Bad identification string.");
                return Err(KeelError::Protocol(msg));
            }
            Err(e) => return Err(e),
        };
        info!(client = %client_id, "client identified");

        let server_id = version.to_string();
        let kex = KeyExchange::server(&server_id, &client_id, &self.host_keys).run(&mut protocol);
        if let Err(e) = kex {
            warn!(error = %e, "key exchange failed");
            if e.disconnect_reason().is_some() {
                disconnect(&mut protocol, DISCONNECT_KEY_EXCHANGE_FAILED, &e.to_string());
            }
            return Err(e);
        }

        let mut dispatcher = Dispatcher::new(protocol);
        dispatcher
            .on(MessageType::Disconnect, Route::Handle)
            .on(MessageType::Ignore, Route::Ignore)
            .on(MessageType::Debug, Route::Ignore)
            .on(MessageType::Unimplemented, Route::Handle)
            .on(MessageType::ServiceRequest, Route::Handle);

        let mut session = Session {
            dispatcher,
            state: SessionState {
                config: Arc::clone(&self.config),
                authenticator: Authenticator::new(Arc::clone(&self.key_store)),
                executor: Arc::clone(&self.executor),
                channel: None,
                next_channel_id: 0,
            },
        };
        session.run()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("host_keys", &self.host_keys)
            .finish()
    }
}

struct Session<R, W> {
    dispatcher: Dispatcher<R, W>,
    state: SessionState,
}

impl<R: Read + WaitReadable, W: Write> Session<R, W> {
    fn run(&mut self) -> KeelResult<()> {
        let poll_interval = self.state.config.poll_interval;
        loop {
            let result = self.step(poll_interval);
            if let Err(e) = result {
                return self.finish(e);
            }
        }
    }

    fn step(&mut self, poll_interval: Duration) -> KeelResult<()> {
        let protocol = self.dispatcher.protocol_mut();
        if !protocol.has_queued() && !protocol.input_mut().wait_readable(poll_interval)? {
            return protocol.flush();
        }
        self.dispatcher.dispatch(&mut self.state, None)?;
        Ok(())
    }

    fn finish(&mut self, error: KeelError) -> KeelResult<()> {
        match error {
            KeelError::Disconnected {
                reason,
                description,
            } => {
                info!(reason, description = %description, "session ended");
                Ok(())
            }
            e => {
                warn!(error = %e, "session failed");
                if let Some(reason) = e.disconnect_reason() {
                    disconnect(self.dispatcher.protocol_mut(), reason, &e.to_string());
                }
                Err(e)
            }
        }
    }
}

struct SessionState {
    config: Arc<ServerConfig>,
    authenticator: Authenticator,
    executor: Arc<dyn Executor>,
    channel: Option<Channel>,
    next_channel_id: u32,
}

impl Handler for SessionState {
    fn handle<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> KeelResult<()> {
        match msg_type {
            MessageType::Disconnect => Err(parse_disconnect(&payload)),
            MessageType::Unimplemented => Err(disconnect(
                dispatcher.protocol_mut(),
                DISCONNECT_PROTOCOL_ERROR,
                "Sorry for my bad packet.",
            )),
            MessageType::ServiceRequest => self.on_service_request(dispatcher, &payload),
            MessageType::UserauthRequest => self.on_userauth_request(dispatcher, &payload),
            MessageType::ChannelOpen => self.on_channel_open(dispatcher, &payload),
            MessageType::ChannelWindowAdjust => {
                let (recipient, bytes_to_add) = parse_window_adjust(&payload)?;
                self.channel_mut(dispatcher, recipient)?.credit(bytes_to_add);
                Ok(())
            }
            MessageType::ChannelData => {
                let (recipient, data) = parse_data(&payload)?;
                self.channel_mut(dispatcher, recipient)?.receive_data(data);
                Ok(())
            }
            MessageType::ChannelEof => {
                let recipient = recipient_channel(&payload)?;
                self.channel_mut(dispatcher, recipient)?.mark_eof_received();
                Ok(())
            }
            MessageType::ChannelClose => {
                let recipient = recipient_channel(&payload)?;
                self.channel_mut(dispatcher, recipient)?;
                self.channel = None;
                Err(disconnect(
                    dispatcher.protocol_mut(),
                    DISCONNECT_BY_APPLICATION,
                    "Bye bye.",
                ))
            }
            MessageType::ChannelRequest => self.on_channel_request(dispatcher, &payload),
            other => {
                debug!(msg_type = %other, "no handler");
                dispatcher.send_unimplemented()
            }
        }
    }
}

impl SessionState {
    fn on_service_request<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        payload: &[u8],
    ) -> KeelResult<()> {
        let mut r = Reader::message(payload, MessageType::ServiceRequest)?;
        let service = String::from_utf8_lossy(r.string()?).into_owned();

        if service != USERAUTH_SERVICE {
            return Err(disconnect(
                dispatcher.protocol_mut(),
                DISCONNECT_SERVICE_NOT_AVAILABLE,
                &format!("{} not supported.", service),
            ));
        }

        let mut w = Writer::message(MessageType::ServiceAccept);
        w.string(&service);
        dispatcher.send(&w.into_vec())?;
        dispatcher.on(MessageType::UserauthRequest, Route::Handle);
        debug!(service = %service, "service accepted");
        Ok(())
    }

    fn on_userauth_request<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        payload: &[u8],
    ) -> KeelResult<()> {
        let session_id = dispatcher
            .protocol()
            .session_id()
            .ok_or_else(|| KeelError::Internal("No session identifier".to_string()))?
            .to_vec();

        let was_authenticated = self.authenticator.is_authenticated();
        let reply = self.authenticator.handle_request(&session_id, payload)?;
        dispatcher.send(&reply)?;

        if !was_authenticated && self.authenticator.is_authenticated() {
            for (msg_type, route) in CHANNEL_ROUTES {
                dispatcher.on(msg_type, route);
            }
        }
        Ok(())
    }

    fn on_channel_open<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        payload: &[u8],
    ) -> KeelResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;

        if self.channel.is_some() {
            debug!(sender = open.sender_channel(), "second channel refused");
            return dispatcher.send(&open_failure_message(
                open.sender_channel(),
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "Only one channel at the time is supported.",
            ));
        }
        if !open.is_session() {
            debug!(channel_type = open.channel_type(), "channel type refused");
            return dispatcher.send(&open_failure_message(
                open.sender_channel(),
                ChannelOpenFailureReason::UnknownChannelType,
                "Only sessions are supported.",
            ));
        }

        let local_id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);

        let channel = Channel::new(
            local_id,
            open.sender_channel(),
            open.initial_window_size(),
            open.maximum_packet_size(),
            self.config.window,
        );
        dispatcher.send(&channel.confirmation().to_bytes())?;
        info!(
            channel = local_id,
            peer_window = open.initial_window_size(),
            peer_max_packet = open.maximum_packet_size(),
            "session channel opened"
        );
        self.channel = Some(channel);
        Ok(())
    }

    fn on_channel_request<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        payload: &[u8],
    ) -> KeelResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let want_reply = request.want_reply();
        let channel = self.channel_mut(dispatcher, request.recipient_channel())?;
        let remote_id = channel.remote_id();
        debug!(
            channel = channel.local_id(),
            request = request.request_type().name(),
            "channel request"
        );

        let reply = |dispatcher: &mut Dispatcher<R, W>, success: bool| -> KeelResult<()> {
            if !want_reply {
                return Ok(());
            }
            let msg_type = if success {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            dispatcher.send(&channel_message(msg_type, remote_id))
        };

        match request.request_type() {
            ChannelRequestType::PtyReq { .. } | ChannelRequestType::Env { .. } => {
                channel.record_environment(&request);
                reply(dispatcher, true)
            }
            ChannelRequestType::Exec { .. } | ChannelRequestType::Shell
                if !channel.start_program() =>
            {
                debug!(channel = channel.local_id(), "program already started");
                reply(dispatcher, false)
            }
            ChannelRequestType::Exec { command } => {
                reply(dispatcher, true)?;
                let output = self.run_line(command);
                let channel = self.channel_mut(dispatcher, request.recipient_channel())?;
                channel.forward_output(dispatcher, &output)?;
                channel.send_exit_status(dispatcher, output.status)?;
                channel.send_eof(dispatcher)?;
                channel.send_close(dispatcher)
            }
            ChannelRequestType::Shell => {
                reply(dispatcher, true)?;
                self.run_shell(dispatcher, request.recipient_channel())
            }
            _ => reply(dispatcher, false),
        }
    }

    /// Interactive shell: line editing over channel input until the user or
    /// the peer ends it.
    fn run_shell<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        local_id: u32,
    ) -> KeelResult<()> {
        let prompt = self.config.prompt.clone();
        self.channel_mut(dispatcher, local_id)?
            .send_data(dispatcher, prompt.as_bytes())?;

        let wanted = move |packet: &[u8]| {
            matches!(
                MessageType::of(packet),
                Some(MessageType::ChannelData | MessageType::ChannelEof)
            ) && recipient_channel(packet).map_or(false, |id| id == local_id)
        };

        let mut editor = LineEditor::new();
        loop {
            let next = match self.channel.as_mut() {
                Some(channel) => channel.next_input(),
                None => return Ok(()),
            };

            let byte = match next {
                Some(byte) => byte,
                None => {
                    self.channel_mut(dispatcher, local_id)?
                        .replenish_window(dispatcher)?;
                    let Some(packet) = dispatcher.dispatch(self, Some(&wanted))? else {
                        continue;
                    };
                    let channel = self.channel_mut(dispatcher, local_id)?;
                    if MessageType::of(&packet) == Some(MessageType::ChannelEof) {
                        debug!(channel = local_id, "peer ended shell input");
                        channel.mark_eof_received();
                        return channel.send_close(dispatcher);
                    }
                    let (_, data) = parse_data(&packet)?;
                    channel.receive_data(data);
                    continue;
                }
            };

            match editor.feed(byte) {
                LineEvent::Nothing => {}
                LineEvent::Echo(bytes) => {
                    self.channel_mut(dispatcher, local_id)?
                        .send_data(dispatcher, &bytes)?;
                }
                LineEvent::Line(line) => {
                    self.channel_mut(dispatcher, local_id)?
                        .send_data(dispatcher, b"\r\n")?;
                    let output = if line.is_empty() {
                        None
                    } else {
                        Some(self.run_line(&line))
                    };
                    let channel = self.channel_mut(dispatcher, local_id)?;
                    if let Some(output) = output {
                        channel.forward_output(dispatcher, &output)?;
                    }
                    channel.send_data(dispatcher, prompt.as_bytes())?;
                }
                LineEvent::Close => {
                    return self
                        .channel_mut(dispatcher, local_id)?
                        .send_close(dispatcher);
                }
            }
        }
    }

    fn run_line(&self, command: &str) -> CommandOutput {
        let env = self
            .channel
            .as_ref()
            .map(|c| c.env().clone())
            .unwrap_or_default();
        match run_command(self.executor.as_ref(), command, &env) {
            Ok(output) => output,
            Err(e) => {
                warn!(command, error = %e, "executor failed");
                CommandOutput {
                    status: EXECUTOR_FAILURE_STATUS,
                    stdout: Vec::new(),
                    stderr: format!("{}\r\n", e).into_bytes(),
                }
            }
        }
    }

    /// Returns the open channel if `recipient` names it; any other id ends
    /// the session.
    fn channel_mut<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        recipient: u32,
    ) -> KeelResult<&mut Channel> {
        match self.channel.as_mut() {
            Some(channel) if channel.local_id() == recipient => Ok(channel),
            _ => Err(disconnect(
                dispatcher.protocol_mut(),
                DISCONNECT_BY_APPLICATION,
                &format!("Bad channel #{}.", recipient),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::authorized_keys::MemoryKeyStore;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    struct NoExec;

    impl Executor for NoExec {
        fn execute(
            &self,
            _argv: &[String],
            _env: &BTreeMap<String, String>,
            _stdin: &mut dyn Read,
            _stdout: &mut dyn Write,
            _stderr: &mut dyn Write,
        ) -> KeelResult<i32> {
            Err(KeelError::NotImplemented("exec".to_string()))
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert!(config.identification.starts_with("keel_"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.window.max_packet, 1_048_576);
        assert_eq!(config.prompt, "$ ");
    }

    #[test]
    fn test_requires_host_key() {
        let result = Server::new(
            ServerConfig::default(),
            HostKeys::new(),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(NoExec),
        );
        assert!(matches!(result, Err(KeelError::Config(_))));
    }

    #[test]
    fn test_disconnect_message_layout() {
        let msg = disconnect_message(11, "Bye bye.");
        let mut r = Reader::message(&msg, MessageType::Disconnect).unwrap();
        assert_eq!(r.uint32().unwrap(), 11);
        assert_eq!(r.utf8().unwrap(), "Bye bye.");
        assert_eq!(r.utf8().unwrap(), "");
        assert!(r.is_empty());
        match parse_disconnect(&msg) {
            KeelError::Disconnected {
                reason,
                description,
            } => {
                assert_eq!(reason, 11);
                assert_eq!(description, "Bye bye.");
            }
            e => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn test_bad_identification_disconnects() {
        let mut keys = HostKeys::new();
        keys.add(Box::new(
            crate::ssh::hostkey::RsaHostKey::from_pem(include_str!(
                "../../tests/fixtures/host_rsa.pem"
            ))
            .unwrap(),
        ));
        let server = Server::new(
            ServerConfig::default(),
            keys,
            Arc::new(MemoryKeyStore::new()),
            Arc::new(NoExec),
        )
        .unwrap();

        let mut output = Vec::new();
        let result = server.serve(Cursor::new(b"GET / HTTP/1.1\r\n".to_vec()), &mut output);
        assert!(matches!(result, Err(KeelError::Protocol(_))));

        let mut input: &[u8] = &output;
        let id = read_identification(&mut input).unwrap();
        assert!(id.starts_with("SSH-2.0-keel_"));

        let mut client = PacketProtocol::new(
            Cursor::new(input.to_vec()),
            Vec::new(),
            Arc::new(Capabilities::default()),
        );
        let packet = client.receive(false).unwrap();
        let mut r = Reader::message(&packet, MessageType::Disconnect).unwrap();
        assert_eq!(r.uint32().unwrap(), DISCONNECT_PROTOCOL_ERROR);
        assert_eq!(r.utf8().unwrap(), "Bad identification string.");
    }
}
