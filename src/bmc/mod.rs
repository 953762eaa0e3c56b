//! The per-VM listener: a single-threaded RMCP/ASF/IPMI engine on one
//! UDP socket.
//!
//! Concurrency contract: one receive, one dispatch, one send at a time.
//! The hypervisor call inside a command handler blocks the loop on
//! purpose: IPMI clients retry on timeout, and serialization keeps the
//! session table coherent. Malformed datagrams are dropped silently and
//! never terminate the listener.

mod dispatch;
mod session;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use vsbmc_protocol::ipmb::Request;
use vsbmc_protocol::session::{
    encode_v15_sessionless, encode_v2_sessionless, parse_v15, payload_type, V2Header,
    AUTH_TYPE_RMCP_PLUS,
};
use vsbmc_protocol::{app_cmd, asf, completion, netfn, rakp, rmcp};

use crate::config::{fakemac_bytes, BmcConfig, ProcessConfig};
use crate::vsphere::{HypervisorClient, VsphereClient};
use crate::{Error, Result};

pub use session::{Phase, Session};

/// Get Channel Authentication Capabilities reply data (after the
/// completion code): channel 1, IPMI 2.0 extended auth, non-null
/// usernames enabled, v2.0 connections only.
const AUTH_CAP_DATA: [u8; 8] = [0x01, 0x80, 0x04, 0x02, 0x00, 0x00, 0x00, 0x00];

/// How long one socket receive may block before the expiry sweep runs.
const RECV_TICK: Duration = Duration::from_secs(1);

/// Settings one listener needs, extracted from a [`BmcConfig`].
#[derive(Debug, Clone)]
pub struct BmcOptions {
    pub vm_name: String,
    pub username: String,
    pub password: String,
    pub address: String,
    pub port: u16,
    pub fakemac: [u8; 6],
    pub session_timeout: Duration,
}

impl BmcOptions {
    pub fn from_config(config: &BmcConfig, session_timeout: Duration) -> Result<Self> {
        let username = config
            .username
            .clone()
            .ok_or_else(|| Error::Config(format!("no username configured for {}", config.vm_name)))?;
        let password = config
            .password
            .clone()
            .ok_or_else(|| Error::Config(format!("no password configured for {}", config.vm_name)))?;
        Ok(BmcOptions {
            vm_name: config.vm_name.clone(),
            username,
            password,
            address: config.address.clone(),
            port: config.port,
            fakemac: fakemac_bytes(&config.fakemac)?,
            session_timeout,
        })
    }
}

/// One virtual BMC: socket, session table, and the hypervisor client the
/// chassis commands act on.
pub struct BmcServer<C: HypervisorClient> {
    pub(crate) options: BmcOptions,
    socket: UdpSocket,
    sessions: HashMap<(SocketAddr, u32), Session>,
    guid: [u8; 16],
    kg: Option<Vec<u8>>,
    pub(crate) client: C,
}

impl<C: HypervisorClient> BmcServer<C> {
    pub fn new(options: BmcOptions, client: C) -> Result<Self> {
        let ip: IpAddr = options
            .address
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind address {:?}", options.address)))?;
        let socket = UdpSocket::bind(SocketAddr::new(ip, options.port))?;
        socket.set_read_timeout(Some(RECV_TICK))?;
        Ok(BmcServer {
            options,
            socket,
            sessions: HashMap::new(),
            guid: *uuid::Uuid::new_v4().as_bytes(),
            kg: None,
            client,
        })
    }

    /// Run the receive loop until `shutdown` is set, then release all
    /// session state.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(
            vm = %self.options.vm_name,
            "virtual BMC listening on [{}]:{}",
            self.options.address,
            self.options.port
        );
        let mut buf = [0u8; 4096];
        while !shutdown.load(Ordering::Relaxed) {
            self.expire_sessions();
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    if let Some(reply) = self.handle_datagram(&buf[..len], peer) {
                        if let Err(e) = self.socket.send_to(&reply, peer) {
                            warn!(vm = %self.options.vm_name, "send to {} failed: {}", peer, e);
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(vm = %self.options.vm_name, "listener shutting down");
        for session in self.sessions.values_mut() {
            session.close(Phase::Closed);
        }
        self.sessions.clear();
        Ok(())
    }

    fn expire_sessions(&mut self) {
        let timeout = self.options.session_timeout;
        let expired: Vec<(SocketAddr, u32)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(timeout))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(mut session) = self.sessions.remove(&key) {
                session.close(Phase::Expired);
                info!(
                    vm = %self.options.vm_name,
                    "session {:#010x} with {} expired", key.1, key.0
                );
            }
        }
    }

    /// Demux one datagram. Returns the reply to send, if any; anything
    /// unparseable is dropped.
    pub(crate) fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        if asf::is_presence_ping(datagram) {
            info!(vm = %self.options.vm_name, "responding to ASF presence ping from {}", peer);
            return Some(asf::presence_pong(datagram).to_vec());
        }

        let (header, rest) = match rmcp::Header::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(vm = %self.options.vm_name, "dropping datagram from {}: {}", peer, e);
                return None;
            }
        };
        if header.class != rmcp::Class::Ipmi {
            return None; // only the presence ping is answered on the ASF class
        }

        if rest.first() == Some(&AUTH_TYPE_RMCP_PLUS) {
            self.handle_v2(datagram, rest, peer)
        } else {
            let (session_id, payload) = parse_v15(rest).ok()?;
            if session_id != 0 {
                return None; // v1.5 sessions are never negotiated
            }
            let request = Request::parse(payload).ok()?;
            self.handle_sessionless(&request, false)
        }
    }

    fn handle_v2(&mut self, datagram: &[u8], rest: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let (header, after) = match V2Header::parse(rest) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(vm = %self.options.vm_name, "dropping RMCP+ datagram from {}: {}", peer, e);
                return None;
            }
        };
        let payload = after.get(..header.payload_len as usize)?;

        match header.payload_type {
            payload_type::OPEN_SESSION_REQUEST => self.handle_open_session(payload, peer),
            payload_type::RAKP1 => self.handle_rakp1(payload, peer),
            payload_type::RAKP3 => self.handle_rakp3(payload, peer),
            payload_type::IPMI if header.session_id == 0 => {
                let request = Request::parse(payload).ok()?;
                self.handle_sessionless(&request, true)
            }
            payload_type::IPMI => self.handle_in_session(&header, after, datagram, peer),
            _ => None,
        }
    }

    /// Legacy sessionless commands: channel authentication capabilities
    /// (in both the v1.5 and the forged v2.0 framing) and channel cipher
    /// suites.
    fn handle_sessionless(&mut self, request: &Request, v2: bool) -> Option<Vec<u8>> {
        if request.netfn != netfn::APP {
            return None;
        }
        let body = match request.cmd {
            app_cmd::GET_CHANNEL_AUTH_CAPABILITIES => {
                let channel = *request.data.first()?;
                if channel & 0x80 == 0 {
                    return None; // v2.0 extended-data bit required
                }
                if channel & 0x0F != 0x0E {
                    return None; // only "this channel" is addressable
                }
                request.response(completion::OK, &AUTH_CAP_DATA)
            }
            app_cmd::GET_CHANNEL_CIPHER_SUITES => {
                let index = request.data.get(2).map_or(0, |b| (b & 0x3F) as usize);
                let records = &rakp::CIPHER_SUITE_RECORDS;
                let start = (index * 16).min(records.len());
                let end = (start + 16).min(records.len());
                let mut data = vec![0x01]; // channel number
                data.extend_from_slice(&records[start..end]);
                request.response(completion::OK, &data)
            }
            _ => return None,
        };
        Some(if v2 {
            encode_v2_sessionless(payload_type::IPMI, &body)
        } else {
            encode_v15_sessionless(&body)
        })
    }

    fn handle_open_session(&mut self, payload: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let request = rakp::OpenSessionRequest::parse(payload).ok()?;
        let session_id = self.new_session_id(peer);
        let response = match Session::open(&request, session_id) {
            Ok(session) => {
                info!(
                    vm = %self.options.vm_name,
                    "opening session {:#010x} for {}", session_id, peer
                );
                let response = rakp::open_session_response(
                    &request,
                    rakp::status::NO_ERRORS,
                    session.max_privilege(),
                    session_id,
                );
                self.sessions.insert((peer, session_id), session);
                response
            }
            Err(status) => {
                debug!(
                    vm = %self.options.vm_name,
                    "rejecting open session from {} with status {:#04x}", peer, status
                );
                rakp::open_session_response(&request, status, request.max_privilege, 0)
            }
        };
        Some(encode_v2_sessionless(
            payload_type::OPEN_SESSION_RESPONSE,
            &response,
        ))
    }

    fn handle_rakp1(&mut self, payload: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let r1 = rakp::Rakp1::parse(payload).ok()?;
        let guid = self.guid;
        let password = if r1.username == self.options.username.as_bytes() {
            Some(self.options.password.clone().into_bytes())
        } else {
            None
        };

        let key = (peer, r1.local_session_id);
        let session = self.sessions.get_mut(&key)?;
        let reply = session.handle_rakp1(&r1, password.as_deref(), &guid);
        if session.phase() == Phase::Closed {
            self.sessions.remove(&key);
        }
        Some(encode_v2_sessionless(payload_type::RAKP2, &reply))
    }

    fn handle_rakp3(&mut self, payload: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let r3 = rakp::Rakp3::parse(payload).ok()?;
        let guid = self.guid;
        let kg = self.kg.clone();

        let key = (peer, r3.local_session_id);
        let session = self.sessions.get_mut(&key)?;
        let (reply, active) = session.handle_rakp3(&r3, kg.as_deref(), &guid);
        if active {
            info!(
                vm = %self.options.vm_name,
                "session {:#010x} with {} is active", key.1, peer
            );
        } else {
            self.sessions.remove(&key);
        }
        if reply.is_empty() {
            return None;
        }
        Some(encode_v2_sessionless(payload_type::RAKP4, &reply))
    }

    fn handle_in_session(
        &mut self,
        header: &V2Header,
        after: &[u8],
        datagram: &[u8],
        peer: SocketAddr,
    ) -> Option<Vec<u8>> {
        let key = (peer, header.session_id);
        let payload = {
            let session = self.sessions.get_mut(&key)?;
            match session.unwrap(header, after, datagram) {
                Ok(payload) => payload.to_vec(),
                Err(e) => {
                    debug!(vm = %self.options.vm_name, "dropping in-session packet: {}", e);
                    return None;
                }
            }
        };
        let request = match Request::parse(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(vm = %self.options.vm_name, "unparseable in-session message: {}", e);
                return None;
            }
        };

        // Session-layer commands run before the dispatch table.
        if request.netfn == netfn::APP {
            match request.cmd {
                app_cmd::SET_SESSION_PRIVILEGE_LEVEL => {
                    let session = self.sessions.get_mut(&key)?;
                    let requested = request.data.first().map_or(0, |b| b & 0x0F);
                    if requested != 0 {
                        session.set_privilege(requested.min(session.max_privilege()));
                    }
                    let granted = session.privilege();
                    let response = request.response(completion::OK, &[granted]);
                    return Some(session.wrap(&response));
                }
                app_cmd::CLOSE_SESSION => {
                    let mut session = self.sessions.remove(&key)?;
                    let response = request.response(completion::OK, &[]);
                    let out = session.wrap(&response);
                    session.close(Phase::Closed);
                    info!(
                        vm = %self.options.vm_name,
                        "session {:#010x} with {} closed", key.1, peer
                    );
                    return Some(out);
                }
                _ => {}
            }
        }

        let reply = self.dispatch_command(&request);
        let response = request.response(reply.code, &reply.data);
        let session = self.sessions.get_mut(&key)?;
        Some(session.wrap(&response))
    }

    fn new_session_id(&self, peer: SocketAddr) -> u32 {
        loop {
            let mut raw = [0u8; 4];
            let _ = getrandom::fill(&mut raw);
            let candidate = u32::from_le_bytes(raw);
            if candidate != 0 && !self.sessions.contains_key(&(peer, candidate)) {
                return candidate;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Entry point for a listener child process: load the configuration,
/// install the graceful-shutdown SIGTERM flag, and run the engine.
///
/// The child is a fresh exec, so the supervisor's own SIGTERM handler is
/// not inherited; the flag registered here makes a targeted signal close
/// the socket and zero the session keys instead of killing mid-dispatch.
pub fn run_listener(process: &ProcessConfig, vm_name: &str) -> Result<()> {
    let config = BmcConfig::load(&process.config_dir, vm_name)?;
    let options = BmcOptions::from_config(&config, process.session_timeout)?;
    let client = VsphereClient::from_config(&config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
        .map_err(|e| Error::Process(format!("failed to install SIGTERM handler: {}", e)))?;

    let mut server = BmcServer::new(options, client)?;
    server.run(&shutdown)
}
