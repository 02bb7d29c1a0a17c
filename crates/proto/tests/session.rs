//! Full server sessions against an in-process client over loopback TCP.
//!
//! The client side is assembled from the crate's own building blocks:
//! identification, [`KeyExchange::client`], and hand-built messages.

use keel_platform::error::{
    DISCONNECT_BY_APPLICATION, DISCONNECT_PROTOCOL_ERROR, DISCONNECT_SERVICE_NOT_AVAILABLE,
};
use keel_platform::{KeelError, KeelResult};
use keel_proto::ssh::auth::{construct_signature_data, AuthMethod, AuthRequest};
use keel_proto::ssh::authorized_keys::MemoryKeyStore;
use keel_proto::ssh::channel::Executor;
use keel_proto::ssh::connection::{
    ChannelOpen, ChannelOpenConfirmation, ChannelRequest, ChannelRequestType,
};
use keel_proto::ssh::hostkey::{HostKey, HostKeys, RsaHostKey};
use keel_proto::ssh::kex::KeyExchange;
use keel_proto::ssh::message::MessageType;
use keel_proto::ssh::server::{Server, ServerConfig};
use keel_proto::ssh::version::{read_identification, write_identification, Version};
use keel_proto::ssh::wire::{Reader, Writer};
use keel_proto::ssh::{Capabilities, PacketProtocol};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const HOST_PEM: &str = include_str!("fixtures/host_rsa.pem");
const USER_PEM: &str = include_str!("fixtures/user_rsa.pem");
const USER_PUB: &str = include_str!("fixtures/user_rsa.pub");

/// Answers a few fixed command lines.
struct ScriptExecutor;

impl Executor for ScriptExecutor {
    fn execute(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> KeelResult<i32> {
        assert_eq!(argv, ["sh".to_string()]);
        let mut command = String::new();
        stdin.read_to_string(&mut command)?;

        if let Some(text) = command.strip_prefix("echo ") {
            writeln!(stdout, "{}", text)?;
            Ok(0)
        } else if command == "printenv TERM" {
            writeln!(stdout, "{}", env.get("TERM").map(String::as_str).unwrap_or(""))?;
            Ok(0)
        } else {
            writeln!(stderr, "sh: {}: not found", command)?;
            Ok(127)
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_server() -> (TcpStream, JoinHandle<KeelResult<()>>) {
    init_tracing();

    let mut host_keys = HostKeys::new();
    host_keys.add(Box::new(RsaHostKey::from_pem(HOST_PEM).unwrap()));
    let mut store = MemoryKeyStore::new();
    store.insert_line("alice", USER_PUB).unwrap();

    let config = ServerConfig {
        poll_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let server = Server::new(
        config,
        host_keys,
        Arc::new(store),
        Arc::new(ScriptExecutor),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept()?;
        server.serve(stream.try_clone()?, stream)
    });

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    (stream, handle)
}

struct Client {
    protocol: PacketProtocol<TcpStream, TcpStream>,
    session_id: Vec<u8>,
    key: RsaHostKey,
}

impl Client {
    /// Connects, exchanges identifications and keys.
    fn connect() -> (Self, JoinHandle<KeelResult<()>>) {
        let (mut stream, handle) = start_server();

        let version = Version::new("test_client", None);
        write_identification(&mut stream, &version).unwrap();
        let server_id = read_identification(&mut stream).unwrap();
        assert!(server_id.starts_with("SSH-2.0-keel_"));

        let mut protocol = PacketProtocol::new(
            stream.try_clone().unwrap(),
            stream,
            Arc::new(Capabilities::default()),
        );
        let host_blob = RsaHostKey::from_pem(HOST_PEM).unwrap().public_key_blob();
        let client_id = version.to_string();
        let outcome = KeyExchange::client(&client_id, &server_id, &host_blob)
            .run(&mut protocol)
            .unwrap();

        let client = Self {
            protocol,
            session_id: outcome.session_id,
            key: RsaHostKey::from_pem(USER_PEM).unwrap(),
        };
        (client, handle)
    }

    /// Connects and logs in as alice.
    fn login() -> (Self, JoinHandle<KeelResult<()>>) {
        let (mut client, handle) = Self::connect();
        client.request_userauth();
        let reply = client.authenticate("alice", true);
        assert_eq!(reply, vec![MessageType::UserauthSuccess as u8]);
        (client, handle)
    }

    fn send(&mut self, payload: &[u8]) {
        self.protocol.send(payload).unwrap();
    }

    fn receive(&mut self) -> Vec<u8> {
        self.protocol.receive(false).unwrap()
    }

    fn expect(&mut self, msg_type: MessageType) -> Vec<u8> {
        let packet = self.receive();
        assert_eq!(MessageType::of(&packet), Some(msg_type), "packet {:?}", packet);
        packet
    }

    fn request_userauth(&mut self) {
        let mut w = Writer::message(MessageType::ServiceRequest);
        w.string("ssh-userauth");
        self.send(&w.into_vec());
        let accept = self.expect(MessageType::ServiceAccept);
        let mut r = Reader::message(&accept, MessageType::ServiceAccept).unwrap();
        assert_eq!(r.utf8().unwrap(), "ssh-userauth");
    }

    fn auth_request(&self, user: &str, signed_for: Option<&[u8]>) -> Vec<u8> {
        let blob = self.key.public_key_blob();
        let signature = signed_for.map(|session_id| {
            let data = construct_signature_data(session_id, user, "ssh-connection", "ssh-rsa", &blob);
            self.key.sign(&data).unwrap()
        });
        AuthRequest::new(
            user,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-rsa".to_string(),
                public_key: blob,
                signature,
            },
        )
        .to_bytes()
    }

    fn authenticate(&mut self, user: &str, signed: bool) -> Vec<u8> {
        let session_id = self.session_id.clone();
        let request = self.auth_request(user, signed.then_some(session_id.as_slice()));
        self.send(&request);
        self.receive()
    }

    /// Opens a session channel with sender id 3 and the given window.
    fn open_session(&mut self, window: u32, max_packet: u32) -> ChannelOpenConfirmation {
        self.send(&ChannelOpen::new("session", 3, window, max_packet).to_bytes());
        let packet = self.expect(MessageType::ChannelOpenConfirmation);
        ChannelOpenConfirmation::from_bytes(&packet).unwrap()
    }

    fn request(&mut self, channel: u32, request_type: ChannelRequestType) {
        self.send(&ChannelRequest::new(channel, request_type, true).to_bytes());
        let reply = self.expect(MessageType::ChannelSuccess);
        assert_eq!(&reply[1..], &[0, 0, 0, 3]);
    }

    fn close_and_expect_bye(&mut self, channel: u32) {
        let mut w = Writer::message(MessageType::ChannelClose);
        w.uint32(channel);
        self.send(&w.into_vec());
        expect_disconnect(&self.expect(MessageType::Disconnect), DISCONNECT_BY_APPLICATION, "Bye bye.");
    }
}

fn expect_disconnect(packet: &[u8], reason: u32, description: &str) {
    let mut r = Reader::message(packet, MessageType::Disconnect).unwrap();
    assert_eq!(r.uint32().unwrap(), reason);
    assert_eq!(r.utf8().unwrap(), description);
}

fn data_of(packet: &[u8]) -> Vec<u8> {
    let mut r = Reader::message(packet, MessageType::ChannelData).unwrap();
    assert_eq!(r.uint32().unwrap(), 3);
    r.string().unwrap().to_vec()
}

#[test]
fn test_exec_session() {
    let (mut client, server) = Client::login();

    let confirmation = client.open_session(1 << 20, 32768);
    assert_eq!(confirmation.recipient_channel, 3);
    assert_eq!(confirmation.initial_window_size, 0x7fff_ffff);
    assert_eq!(confirmation.maximum_packet_size, 1_048_576);
    let channel = confirmation.sender_channel;

    client.request(
        channel,
        ChannelRequestType::Exec {
            command: "echo hello".to_string(),
        },
    );

    assert_eq!(data_of(&client.expect(MessageType::ChannelData)), b"hello\r\n");

    let exit = client.expect(MessageType::ChannelRequest);
    let exit = ChannelRequest::from_bytes(&exit).unwrap();
    assert_eq!(exit.recipient_channel(), 3);
    assert!(!exit.want_reply());
    assert_eq!(
        exit.request_type(),
        &ChannelRequestType::ExitStatus { exit_status: 0 }
    );

    client.expect(MessageType::ChannelEof);
    client.expect(MessageType::ChannelClose);
    client.close_and_expect_bye(channel);

    server.join().unwrap().unwrap();
}

#[test]
fn test_exec_stderr_and_status() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;

    client.request(
        channel,
        ChannelRequestType::Exec {
            command: "frobnicate".to_string(),
        },
    );

    let ext = client.expect(MessageType::ChannelExtendedData);
    let mut r = Reader::message(&ext, MessageType::ChannelExtendedData).unwrap();
    assert_eq!(r.uint32().unwrap(), 3);
    assert_eq!(r.uint32().unwrap(), 1);
    assert_eq!(r.string().unwrap(), b"sh: frobnicate: not found\r\n");

    let exit = ChannelRequest::from_bytes(&client.expect(MessageType::ChannelRequest)).unwrap();
    assert_eq!(
        exit.request_type(),
        &ChannelRequestType::ExitStatus { exit_status: 127 }
    );
    client.expect(MessageType::ChannelEof);
    client.expect(MessageType::ChannelClose);
    client.close_and_expect_bye(channel);

    server.join().unwrap().unwrap();
}

#[test]
fn test_small_peer_window_gets_one_adjust() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(4, 32768).sender_channel;

    client.request(
        channel,
        ChannelRequestType::Exec {
            command: "echo hello".to_string(),
        },
    );

    let adjust = client.expect(MessageType::ChannelWindowAdjust);
    let mut r = Reader::message(&adjust, MessageType::ChannelWindowAdjust).unwrap();
    assert_eq!(r.uint32().unwrap(), 3);
    assert_eq!(r.uint32().unwrap(), 0x7fff_ffff);
    assert_eq!(data_of(&client.expect(MessageType::ChannelData)), b"hello\r\n");
    client.expect(MessageType::ChannelRequest);
    client.expect(MessageType::ChannelEof);
    client.expect(MessageType::ChannelClose);
    client.close_and_expect_bye(channel);

    server.join().unwrap().unwrap();
}

#[test]
fn test_shell_line_editing() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;

    client.request(
        channel,
        ChannelRequestType::PtyReq {
            term: "vt220".to_string(),
            width_chars: 80,
            height_rows: 24,
            width_pixels: 0,
            height_pixels: 0,
            modes: vec![0],
        },
    );

    // typed ahead of the shell request: buffered, then consumed first
    let mut w = Writer::message(MessageType::ChannelData);
    w.uint32(channel).string(b"printenv TERM\r");
    client.send(&w.into_vec());

    client.request(channel, ChannelRequestType::Shell);

    let mut w = Writer::message(MessageType::ChannelData);
    w.uint32(channel).string(b"echx\x7fo hi\r\x1b\x04");
    client.send(&w.into_vec());

    let mut screen = Vec::new();
    loop {
        let packet = client.receive();
        match MessageType::of(&packet) {
            Some(MessageType::ChannelData) => screen.extend(data_of(&packet)),
            Some(MessageType::ChannelClose) => break,
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(
        String::from_utf8_lossy(&screen),
        "$ printenv TERM\r\nvt220\r\n$ echx\x08 \x08o hi\r\nhi\r\n$ "
    );

    client.close_and_expect_bye(channel);
    server.join().unwrap().unwrap();
}

#[test]
fn test_shell_ends_on_peer_eof() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;
    client.request(channel, ChannelRequestType::Shell);
    assert_eq!(data_of(&client.expect(MessageType::ChannelData)), b"$ ");

    let mut w = Writer::message(MessageType::ChannelEof);
    w.uint32(channel);
    client.send(&w.into_vec());
    client.expect(MessageType::ChannelClose);
    client.close_and_expect_bye(channel);

    server.join().unwrap().unwrap();
}

#[test]
fn test_second_shell_request_refused() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;
    client.request(channel, ChannelRequestType::Shell);
    assert_eq!(data_of(&client.expect(MessageType::ChannelData)), b"$ ");

    for request_type in [
        ChannelRequestType::Shell,
        ChannelRequestType::Exec {
            command: "echo again".to_string(),
        },
    ] {
        client.send(&ChannelRequest::new(channel, request_type, true).to_bytes());
        let reply = client.expect(MessageType::ChannelFailure);
        assert_eq!(&reply[1..], &[0, 0, 0, 3]);
    }

    // the running shell keeps its editor and prompts once per line
    let mut w = Writer::message(MessageType::ChannelData);
    w.uint32(channel).string(b"echo hi\r\x04");
    client.send(&w.into_vec());

    let mut screen = Vec::new();
    loop {
        let packet = client.receive();
        match MessageType::of(&packet) {
            Some(MessageType::ChannelData) => screen.extend(data_of(&packet)),
            Some(MessageType::ChannelClose) => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(String::from_utf8_lossy(&screen), "echo hi\r\nhi\r\n$ ");

    client.close_and_expect_bye(channel);
    server.join().unwrap().unwrap();
}

#[test]
fn test_data_after_exec_is_dropped() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;
    client.request(
        channel,
        ChannelRequestType::Exec {
            command: "echo hello".to_string(),
        },
    );
    client.expect(MessageType::ChannelData);
    client.expect(MessageType::ChannelRequest);
    client.expect(MessageType::ChannelEof);
    client.expect(MessageType::ChannelClose);

    for _ in 0..8 {
        let mut w = Writer::message(MessageType::ChannelData);
        w.uint32(channel).string(vec![b'x'; 16 * 1024]);
        client.send(&w.into_vec());
    }
    client.send(
        &ChannelRequest::new(
            channel,
            ChannelRequestType::Exec {
                command: "echo again".to_string(),
            },
            true,
        )
        .to_bytes(),
    );
    client.expect(MessageType::ChannelFailure);

    client.close_and_expect_bye(channel);
    server.join().unwrap().unwrap();
}

#[test]
fn test_one_channel_only() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;

    client.send(&ChannelOpen::new("session", 8, 1024, 1024).to_bytes());
    let failure = client.expect(MessageType::ChannelOpenFailure);
    let mut r = Reader::message(&failure, MessageType::ChannelOpenFailure).unwrap();
    assert_eq!(r.uint32().unwrap(), 8);
    assert_eq!(r.uint32().unwrap(), 1);
    assert_eq!(r.utf8().unwrap(), "Only one channel at the time is supported.");

    // unknown request types fail without ending the session
    client.send(
        &ChannelRequest::new(channel, ChannelRequestType::Other("x11-req".to_string()), true)
            .to_bytes(),
    );
    client.expect(MessageType::ChannelFailure);

    client.close_and_expect_bye(channel);
    server.join().unwrap().unwrap();
}

#[test]
fn test_only_session_channels() {
    let (mut client, server) = Client::login();

    client.send(&ChannelOpen::new("direct-tcpip", 4, 1024, 1024).to_bytes());
    let failure = client.expect(MessageType::ChannelOpenFailure);
    let mut r = Reader::message(&failure, MessageType::ChannelOpenFailure).unwrap();
    assert_eq!(r.uint32().unwrap(), 4);
    assert_eq!(r.uint32().unwrap(), 3);
    assert_eq!(r.utf8().unwrap(), "Only sessions are supported.");

    let mut w = Writer::message(MessageType::Disconnect);
    w.uint32(DISCONNECT_BY_APPLICATION).string("done").string("");
    client.send(&w.into_vec());
    server.join().unwrap().unwrap();
}

#[test]
fn test_bad_channel_disconnects() {
    let (mut client, server) = Client::login();
    let channel = client.open_session(1 << 20, 32768).sender_channel;

    client.send(&ChannelRequest::new(channel + 5, ChannelRequestType::Shell, true).to_bytes());
    expect_disconnect(
        &client.expect(MessageType::Disconnect),
        DISCONNECT_BY_APPLICATION,
        &format!("Bad channel #{}.", channel + 5),
    );
    server.join().unwrap().unwrap();
}

#[test]
fn test_auth_query_sign_and_no_reauth() {
    let (mut client, server) = Client::connect();
    client.request_userauth();

    let reply = client.authenticate("alice", false);
    let mut r = Reader::message(&reply, MessageType::UserauthPkOk).unwrap();
    assert_eq!(r.utf8().unwrap(), "ssh-rsa");
    assert_eq!(r.string().unwrap(), client.key.public_key_blob().as_slice());

    let reply = client.authenticate("mallory", true);
    let mut r = Reader::message(&reply, MessageType::UserauthFailure).unwrap();
    assert_eq!(r.name_list().unwrap(), vec!["publickey".to_string()]);
    assert!(!r.boolean().unwrap());

    assert_eq!(
        client.authenticate("alice", true),
        vec![MessageType::UserauthSuccess as u8]
    );

    let reply = client.authenticate("alice", true);
    let mut r = Reader::message(&reply, MessageType::UserauthFailure).unwrap();
    assert!(r.name_list().unwrap().is_empty());

    let mut w = Writer::message(MessageType::Disconnect);
    w.uint32(DISCONNECT_BY_APPLICATION).string("done").string("");
    client.send(&w.into_vec());
    server.join().unwrap().unwrap();
}

#[test]
fn test_signature_replay_across_sessions_fails() {
    let (first, first_server) = Client::connect();
    let replayed = first.auth_request("alice", Some(first.session_id.as_slice()));
    drop(first);
    assert!(first_server.join().unwrap().is_err());

    let (mut second, second_server) = Client::connect();
    assert_ne!(second.session_id, Vec::<u8>::new());
    second.request_userauth();
    second.send(&replayed);
    let reply = second.receive();
    assert_eq!(MessageType::of(&reply), Some(MessageType::UserauthFailure));

    drop(second);
    assert!(second_server.join().unwrap().is_err());
}

#[test]
fn test_channel_before_auth_is_unimplemented() {
    let (mut client, server) = Client::connect();

    // KEXINIT, KEXDH_INIT and NEWKEYS took sequence numbers 0 to 2
    client.send(&ChannelOpen::new("session", 0, 1024, 1024).to_bytes());
    let reply = client.expect(MessageType::Unimplemented);
    let mut r = Reader::message(&reply, MessageType::Unimplemented).unwrap();
    assert_eq!(r.uint32().unwrap(), 3);

    // so is a second key exchange
    client.send(&[MessageType::KexInit as u8, 0, 0]);
    let reply = client.expect(MessageType::Unimplemented);
    let mut r = Reader::message(&reply, MessageType::Unimplemented).unwrap();
    assert_eq!(r.uint32().unwrap(), 4);

    drop(client);
    assert!(matches!(server.join().unwrap(), Err(KeelError::Io(_))));
}

#[test]
fn test_unknown_service_disconnects() {
    let (mut client, server) = Client::connect();

    let mut w = Writer::message(MessageType::ServiceRequest);
    w.string("ssh-connection");
    client.send(&w.into_vec());
    expect_disconnect(
        &client.expect(MessageType::Disconnect),
        DISCONNECT_SERVICE_NOT_AVAILABLE,
        "ssh-connection not supported.",
    );
    server.join().unwrap().unwrap();
}

#[test]
fn test_peer_unimplemented_disconnects() {
    let (mut client, server) = Client::connect();

    let mut w = Writer::message(MessageType::Unimplemented);
    w.uint32(5);
    client.send(&w.into_vec());
    expect_disconnect(
        &client.expect(MessageType::Disconnect),
        DISCONNECT_PROTOCOL_ERROR,
        "Sorry for my bad packet.",
    );
    server.join().unwrap().unwrap();
}

#[test]
fn test_ignore_and_debug_are_silent() {
    let (mut client, server) = Client::connect();

    client.send(b"\x02\x00\x00\x00\x04junk");
    let mut w = Writer::message(MessageType::Debug);
    w.boolean(false).string("hello").string("");
    client.send(&w.into_vec());
    client.request_userauth();

    let mut w = Writer::message(MessageType::Disconnect);
    w.uint32(DISCONNECT_BY_APPLICATION).string("done").string("");
    client.send(&w.into_vec());
    server.join().unwrap().unwrap();
}
