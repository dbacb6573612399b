// One proxied connection. Two pump tasks relay framed packets between client
// and backend while a shared state machine watches bind traffic; a successful
// first factor holds the backend response back until the directory has been
// consulted and the second factor decided.

use crate::ber::Node;
use crate::bind;
use crate::cache::SharedCaches;
use crate::config::ClientPolicy;
use crate::directory::DirectoryClient;
use crate::framing::Framer;
use crate::identity::{self, DomainTable, NameKind};
use crate::metrics::Metrics;
use crate::mfa::{privacy_filtered, AccessVerdict, SecondFactorVerifier};
use crate::protocol::{self, Packet, ProtocolOp, ResultCode};
use crate::transform;
use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Where this connection stands in the bind exchange. Driven by the client
/// pump on requests and the backend pump on responses.
#[derive(Debug)]
enum BindFlow {
    Idle,
    /// A search filtering on a login attribute went out; the next entry that
    /// comes back names the DN behind that login.
    UserDnSearch { lookup: String },
    /// A bind with an extractable username went to the backend and its
    /// response is awaited. A newer bind replaces an older pending one: the
    /// last bind before the response is the one that authenticates.
    BindRequested(PendingBind),
    /// A rejection was synthesized; nothing is intercepted any more and the
    /// session is about to close.
    Failed,
}

#[derive(Debug)]
struct PendingBind {
    message_id: i32,
    /// Login after the first-factor transform; the pipeline starts from this.
    username: String,
    /// Login exactly as the client sent it, for log lines.
    original: String,
}

/// State both pump tasks hang on to.
struct SessionShared {
    peer: SocketAddr,
    policy: Arc<ClientPolicy>,
    caches: Arc<SharedCaches>,
    verifier: Arc<dyn SecondFactorVerifier>,
    metrics: Arc<Metrics>,
    flow: Mutex<BindFlow>,
}

impl SessionShared {
    /// The flow state is a plain enum; a poisoned lock still holds a usable
    /// value, so recover it instead of propagating the poison.
    fn flow(&self) -> MutexGuard<'_, BindFlow> {
        self.flow.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What the post-bind pipeline decided about a successful first factor.
enum BindOutcome {
    /// Release the backend's own success response.
    Allowed,
    /// Suppress it and synthesize this result code instead.
    Rejected(ResultCode),
}

/// One client connection being proxied under a single client policy.
pub struct ProxySession {
    shared: Arc<SessionShared>,
}

impl ProxySession {
    pub fn new(
        peer: SocketAddr,
        policy: Arc<ClientPolicy>,
        caches: Arc<SharedCaches>,
        verifier: Arc<dyn SecondFactorVerifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        ProxySession {
            shared: Arc::new(SessionShared {
                peer,
                policy,
                caches,
                verifier,
                metrics,
                flow: Mutex::new(BindFlow::Idle),
            }),
        }
    }

    /// Pump both directions until either side closes or a policy decision
    /// ends the session. The backend write half sits behind a mutex so the
    /// post-bind pipeline can own the backend exclusively while it queries.
    pub async fn run<C, B>(self, client: C, backend: B) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = io::split(client);
        let (backend_read, backend_write) = io::split(backend);
        let backend_write = Arc::new(AsyncMutex::new(backend_write));

        let mut client_pump = tokio::spawn(pump_client(
            Arc::clone(&self.shared),
            client_read,
            Arc::clone(&backend_write),
        ));
        let mut backend_pump = tokio::spawn(pump_backend(
            Arc::clone(&self.shared),
            backend_read,
            backend_write,
            client_write,
        ));

        let finished = tokio::select! {
            r = &mut client_pump => {
                backend_pump.abort();
                r
            }
            r = &mut backend_pump => {
                client_pump.abort();
                r
            }
        };
        match finished {
            Ok(result) => result,
            Err(e) => Err(anyhow!("session task for {} failed: {e}", self.shared.peer)),
        }
    }
}

/// Client-to-backend direction: watch for binds and login searches, forward
/// everything. Unframeable or undecodable packets pass through untouched.
async fn pump_client<C, B>(
    shared: Arc<SessionShared>,
    mut client_read: ReadHalf<C>,
    backend_write: Arc<AsyncMutex<WriteHalf<B>>>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut framer = Framer::new();
    loop {
        let frame = framer.read_packet(&mut client_read).await?;
        if frame.is_end_of_stream() {
            debug!("client {} closed the connection", shared.peer);
            return Ok(());
        }
        let rewritten = if !frame.valid {
            shared.metrics.inc_framing_passthrough();
            debug!("unframeable client packet from {}, forwarding raw", shared.peer);
            None
        } else {
            match Packet::decode(&frame.bytes) {
                Ok(packet) => intercept_client_packet(&shared, &packet),
                Err(e) => {
                    shared.metrics.inc_framing_passthrough();
                    debug!("undecodable client packet from {}: {e:#}", shared.peer);
                    None
                }
            }
        };
        let mut writer = backend_write.lock().await;
        writer
            .write_all(rewritten.as_deref().unwrap_or(&frame.bytes))
            .await?;
        writer.flush().await?;
    }
}

/// Inspect one decoded client packet, updating the flow state. Returns the
/// replacement bytes when the bind name was rewritten, None to forward as-is.
fn intercept_client_packet(shared: &SessionShared, packet: &Packet) -> Option<Vec<u8>> {
    match packet.classify() {
        ProtocolOp::SearchRequest(op) => {
            if let Some(lookup) = protocol::user_lookup_value(op) {
                let mut flow = shared.flow();
                if matches!(&*flow, BindFlow::Idle | BindFlow::UserDnSearch { .. }) {
                    debug!("watching lookup of {lookup:?} from {}", shared.peer);
                    *flow = BindFlow::UserDnSearch { lookup };
                }
            }
            None
        }
        ProtocolOp::BindRequest(op) => intercept_bind(shared, packet, op),
        _ => None,
    }
}

fn intercept_bind(shared: &SessionShared, packet: &Packet, op: &Node) -> Option<Vec<u8>> {
    let policy = &shared.policy;
    let mechanism = match bind::classify(op) {
        Some(m) => m,
        None => {
            debug!("unrecognized bind mechanism from {}, passing through", shared.peer);
            return None;
        }
    };
    let username = match mechanism.extract_username(op) {
        Ok(Some(name)) => name,
        Ok(None) => {
            debug!("{} bind leg without a username from {}", mechanism.name(), shared.peer);
            return None;
        }
        Err(e) => {
            warn!(
                "cannot read a username out of a {} bind from {}: {e:#}",
                mechanism.name(),
                shared.peer
            );
            return None;
        }
    };
    if policy.is_service_account(&username) {
        info!("service account {username} from {}, passing through", shared.peer);
        return None;
    }

    let transformed = transform::apply(&username, &policy.transform_before_first_factor);
    {
        let mut flow = shared.flow();
        if matches!(&*flow, BindFlow::Failed) {
            return None;
        }
        *flow = BindFlow::BindRequested(PendingBind {
            message_id: packet.message_id(),
            username: transformed.clone(),
            original: username.clone(),
        });
    }
    shared.metrics.inc_binds_intercepted();
    info!(
        "intercepted {} bind of {username} from {} (message {})",
        mechanism.name(),
        shared.peer,
        packet.message_id()
    );

    // What the backend should authenticate: a DN assembled under the
    // configured base, or the transformed spelling when a rule changed it.
    let target = match (&policy.base_dn, identity::classify(&transformed)) {
        (Some(base), kind) if kind != NameKind::DistinguishedName => {
            Some(format!("uid={transformed},{base}"))
        }
        _ if transformed != username => Some(transformed.clone()),
        _ => None,
    };
    let target = target?;
    match mechanism.rewrite_name(op, &target) {
        Some(new_op) => {
            debug!("first factor will bind as {target}");
            Some(packet.with_op(new_op).to_bytes())
        }
        None => {
            warn!(
                "{} binds carry no rewritable name, {username} goes to the backend unchanged",
                mechanism.name()
            );
            None
        }
    }
}

/// Backend-to-client direction: correlate login searches, intercept the
/// response to a pending bind, forward everything else.
async fn pump_backend<B, C>(
    shared: Arc<SessionShared>,
    mut backend_read: ReadHalf<B>,
    backend_write: Arc<AsyncMutex<WriteHalf<B>>>,
    mut client_write: WriteHalf<C>,
) -> Result<()>
where
    B: AsyncRead + AsyncWrite + Send + 'static,
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut framer = Framer::new();
    loop {
        let frame = framer.read_packet(&mut backend_read).await?;
        if frame.is_end_of_stream() {
            debug!("backend closed the connection for {}", shared.peer);
            return Ok(());
        }
        if !frame.valid {
            shared.metrics.inc_framing_passthrough();
            debug!("unframeable backend packet for {}, forwarding raw", shared.peer);
            client_write.write_all(&frame.bytes).await?;
            client_write.flush().await?;
            continue;
        }
        let packet = match Packet::decode(&frame.bytes) {
            Ok(p) => p,
            Err(e) => {
                shared.metrics.inc_framing_passthrough();
                debug!("undecodable backend packet for {}: {e:#}", shared.peer);
                client_write.write_all(&frame.bytes).await?;
                client_write.flush().await?;
                continue;
            }
        };
        match packet.classify() {
            ProtocolOp::SearchResultEntry(op) => {
                let lookup = {
                    let mut flow = shared.flow();
                    match std::mem::replace(&mut *flow, BindFlow::Idle) {
                        BindFlow::UserDnSearch { lookup } => Some(lookup),
                        other => {
                            *flow = other;
                            None
                        }
                    }
                };
                if let Some(lookup) = lookup {
                    if let Ok(entry) = protocol::parse_search_entry(op) {
                        debug!("correlated {} to login {lookup:?}", entry.object_name);
                        shared.caches.dn_cn.observe(&entry.object_name, &lookup);
                    }
                }
            }
            ProtocolOp::SearchResultDone(_) => {
                let mut flow = shared.flow();
                if matches!(&*flow, BindFlow::UserDnSearch { .. }) {
                    *flow = BindFlow::Idle;
                }
            }
            ProtocolOp::BindResponse(op) => {
                let pending = {
                    let mut flow = shared.flow();
                    match std::mem::replace(&mut *flow, BindFlow::Idle) {
                        BindFlow::BindRequested(p) if p.message_id == packet.message_id() => {
                            Some(p)
                        }
                        other => {
                            *flow = other;
                            None
                        }
                    }
                };
                if let Some(pending) = pending {
                    match protocol::parse_ldap_result(op) {
                        Err(e) => {
                            // Cannot tell success from failure; give up on
                            // this bind and let the response through.
                            debug!("unreadable bind response for {}: {e:#}", shared.peer);
                        }
                        Ok(result) if result.is_sasl_in_progress() => {
                            debug!(
                                "multi-stage bind of {} continues (message {})",
                                pending.original, pending.message_id
                            );
                            *shared.flow() = BindFlow::BindRequested(pending);
                        }
                        Ok(result) if !result.is_success() => {
                            info!(
                                "first factor for {} failed: {}",
                                pending.original,
                                result.describe()
                            );
                            failed_bind_delay(&shared.policy).await;
                        }
                        Ok(_) => {
                            debug!("first factor for {} succeeded", pending.original);
                            let outcome = {
                                let mut writer = backend_write.lock().await;
                                run_post_bind(
                                    &shared,
                                    &pending,
                                    &mut *writer,
                                    &mut backend_read,
                                    &mut client_write,
                                    &mut framer,
                                )
                                .await?
                            };
                            if let BindOutcome::Rejected(code) = outcome {
                                shared.metrics.inc_binds_rejected();
                                failed_bind_delay(&shared.policy).await;
                                let rejection =
                                    Packet::bind_response(pending.message_id, code, "");
                                client_write.write_all(&rejection.to_bytes()).await?;
                                client_write.flush().await?;
                                *shared.flow() = BindFlow::Failed;
                                info!(
                                    "closing {} after rejecting the bind of {}",
                                    shared.peer, pending.original
                                );
                                return Ok(());
                            }
                            // Allowed: fall through and release the backend's
                            // own success response.
                        }
                    }
                }
            }
            _ => {}
        }
        client_write.write_all(&frame.bytes).await?;
        client_write.flush().await?;
    }
}

/// Directory work and the second-factor decision after a successful first
/// factor. Runs with the backend write half locked, so its queries and the
/// client's forwarded packets never interleave on the backend stream.
async fn run_post_bind<W, R, C>(
    shared: &SessionShared,
    pending: &PendingBind,
    backend_write: &mut W,
    backend_read: &mut R,
    client_write: &mut C,
    framer: &mut Framer,
) -> Result<BindOutcome>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let policy = &shared.policy;
    let mut username = transform::apply(&pending.username, &policy.transform_before_second_factor);
    if username != pending.username {
        debug!("second-factor identity transformed to {username}");
    }

    let mut directory = DirectoryClient::new(backend_write, backend_read, client_write, framer);

    // Every query below is relative to one naming context.
    let base_dn = match &policy.base_dn {
        Some(base) => base.clone(),
        None => directory
            .base_dn()
            .await?
            .context("backend exposes no defaultNamingContext")?,
    };

    let mut profile = None;
    let mut profile_searched = false;
    if let Some(format) = policy.identity_format {
        profile = directory.find_profile(&base_dn, &username).await?;
        profile_searched = true;
        let kind = identity::classify(&username);
        let domains = if matches!(kind, NameKind::NetbiosAndUid | NameKind::UidAndNetbios) {
            directory.domain_table(&base_dn).await?
        } else {
            DomainTable::default()
        };
        let formatted = identity::format_name(&username, format, &domains, profile.as_ref());
        if formatted != username {
            debug!("identity reformatted from {username} to {formatted}");
            username = formatted;
            // The profile belongs to the old spelling; look it up again.
            profile = None;
            profile_searched = false;
        }
    }

    if policy.needs_profile() && profile.is_none() && !profile_searched {
        profile = directory.find_profile(&base_dn, &username).await?;
    }
    if policy.needs_profile() && profile.is_none() {
        info!("no directory profile for {username}, rejecting the bind");
        return Ok(BindOutcome::Rejected(ResultCode::NoSuchObject));
    }

    if policy.wants_groups() {
        if let Some(p) = profile.as_mut() {
            p.groups = directory
                .group_names(&base_dn, &p.dn, policy.nested_groups)
                .await?;
            debug!("{username} belongs to {} groups", p.groups.len());
        }
    }
    let groups: &[String] = profile.as_ref().map(|p| p.groups.as_slice()).unwrap_or(&[]);

    if !policy.access_groups.is_empty() && !member_of_any(groups, &policy.access_groups) {
        info!("{username} is in no access group, rejecting the bind");
        return Ok(BindOutcome::Rejected(ResultCode::InvalidCredentials));
    }

    let bypass = if !policy.second_factor_groups.is_empty()
        && !member_of_any(groups, &policy.second_factor_groups)
    {
        debug!("{username} is outside every mandatory second-factor group");
        true
    } else {
        !policy.second_factor_bypass_groups.is_empty()
            && member_of_any(groups, &policy.second_factor_bypass_groups)
    };
    if bypass {
        shared.metrics.inc_second_factor_bypassed();
        info!("second factor bypassed for {username}");
        return Ok(BindOutcome::Allowed);
    }

    // DN logins reach the verifier by their short uid when the profile has one.
    let mut api_identity = username.clone();
    if identity::classify(&api_identity) == NameKind::DistinguishedName {
        match profile.as_ref().and_then(|p| p.uid.as_deref()) {
            Some(uid) => api_identity = uid.to_string(),
            None => warn!("profile of {username} has no uid to shorten the DN login"),
        }
    }

    if shared
        .caches
        .auth
        .try_hit(&policy.name, &api_identity, policy.auth_cache_ttl)
    {
        shared.metrics.inc_second_factor_cached();
        debug!("second factor for {api_identity} satisfied from cache");
        return Ok(BindOutcome::Allowed);
    }

    let context = privacy_filtered(profile.as_ref(), policy.privacy_mode, &policy.privacy_fields);
    let verdict = match shared
        .verifier
        .verify(&policy.name, &api_identity, &context)
        .await
    {
        Ok(v) => v,
        Err(e) => {
            warn!("second-factor verification errored for {api_identity}: {e:#}");
            AccessVerdict::Denied
        }
    };
    match verdict {
        AccessVerdict::Granted => {
            shared.caches.auth.set(&policy.name, &api_identity);
            shared.metrics.inc_second_factor_granted();
            info!("second factor granted for {api_identity}");
            Ok(BindOutcome::Allowed)
        }
        AccessVerdict::Denied => {
            shared.metrics.inc_second_factor_denied();
            info!("second factor denied for {api_identity}");
            Ok(BindOutcome::Rejected(ResultCode::InvalidCredentials))
        }
    }
}

/// Hold a failed bind back for the policy's randomized window. Zero max
/// disables the tarpit.
async fn failed_bind_delay(policy: &ClientPolicy) {
    let (min, max) = (policy.bind_delay_min, policy.bind_delay_max);
    if max.is_zero() {
        return;
    }
    let wait = if min == max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    };
    debug!("delaying the failed bind for {wait:?}");
    tokio::time::sleep(wait).await;
}

fn member_of_any(groups: &[String], wanted: &[String]) -> bool {
    wanted
        .iter()
        .any(|w| groups.iter().any(|g| g.eq_ignore_ascii_case(w)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::Tag;
    use crate::config::ClientConfig;
    use crate::identity::IdentityFormat;
    use crate::mfa::VerifyContext;
    use crate::testutil::{
        bind_request_packet, bind_response_packet, done_packet, entry_packet, read_request,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct MockVerifier {
        verdict: AccessVerdict,
        calls: AtomicUsize,
        identities: Mutex<Vec<String>>,
    }

    impl MockVerifier {
        fn new(verdict: AccessVerdict) -> Arc<MockVerifier> {
            Arc::new(MockVerifier {
                verdict,
                calls: AtomicUsize::new(0),
                identities: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn seen(&self) -> Vec<String> {
            self.identities.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SecondFactorVerifier for MockVerifier {
        async fn verify(
            &self,
            _client: &str,
            identity: &str,
            _context: &VerifyContext,
        ) -> Result<AccessVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.identities.lock().unwrap().push(identity.to_string());
            Ok(self.verdict)
        }
    }

    fn spawn_session(
        config: ClientConfig,
        verifier: Arc<dyn SecondFactorVerifier>,
        caches: Arc<SharedCaches>,
        metrics: Arc<Metrics>,
    ) -> (
        DuplexStream,
        DuplexStream,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let policy = Arc::new(config.compile().expect("test policy compiles"));
        let session = ProxySession::new(
            "203.0.113.9:40000".parse().unwrap(),
            policy,
            caches,
            verifier,
            metrics,
        );
        let (client, proxy_client) = duplex(64 * 1024);
        let (proxy_backend, backend) = duplex(64 * 1024);
        let handle = tokio::spawn(session.run(proxy_client, proxy_backend));
        (client, backend, handle)
    }

    fn corp_config() -> ClientConfig {
        ClientConfig {
            base_dn: Some("DC=corp,DC=example".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generic_traffic_passes_through() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let (mut client, mut backend, handle) = spawn_session(
            ClientConfig::default(),
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );

        // UnbindRequest is nothing the proxy cares about
        let request = Node::sequence(vec![
            Node::integer(7),
            Node::leaf(Tag::application(2), Vec::new()),
        ])
        .to_bytes();
        client.write_all(&request).await.unwrap();
        let mut seen = vec![0u8; request.len()];
        backend.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, request);

        // An unsolicited backend packet rides back untouched
        let note = bind_response_packet(99, ResultCode::Busy.as_byte());
        backend.write_all(&note).await.unwrap();
        let mut back = vec![0u8; note.len()];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(back, note);

        assert_eq!(verifier.calls(), 0);
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_packet_forwarded_raw() {
        let metrics = Arc::new(Metrics::new());
        let (mut client, mut backend, handle) = spawn_session(
            ClientConfig::default(),
            MockVerifier::new(AccessVerdict::Granted),
            Arc::new(SharedCaches::new()),
            metrics.clone(),
        );

        // Well-framed sequence whose inner child claims more bytes than exist
        let garbage = vec![0x30, 0x03, 0x04, 0x05, 0x41];
        client.write_all(&garbage).await.unwrap();
        let mut seen = vec![0u8; garbage.len()];
        backend.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, garbage);
        assert_eq!(metrics.framing_passthrough.load(Ordering::Relaxed), 1);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_simple_bind_rewritten_and_granted() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let metrics = Arc::new(Metrics::new());
        let (mut client, mut backend, handle) = spawn_session(
            corp_config(),
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            metrics.clone(),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(1, "j.doe", "hunter2"))
            .await
            .unwrap();

        let bound = read_request(&mut bframer, &mut backend).await;
        assert_eq!(bound.message_id(), 1);
        assert_eq!(
            bound.op().child(1).unwrap().as_str().unwrap(),
            "uid=j.doe,DC=corp,DC=example"
        );
        // Password rides along untouched
        assert_eq!(bound.op().child(2).unwrap().value(), b"hunter2");

        backend
            .write_all(&bind_response_packet(1, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        // The proxy now loads the profile over this same connection
        let search = read_request(&mut bframer, &mut backend).await;
        let sid = search.message_id();
        assert!(sid > 1);
        backend
            .write_all(&entry_packet(
                sid,
                "CN=Jane Doe,DC=corp,DC=example",
                &[("displayName", &["Jane Doe"]), ("sAMAccountName", &["j.doe"])],
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(sid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        // Verified: the backend's own success response reaches the client
        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert_eq!(response.message_id(), 1);
        assert!(protocol::parse_ldap_result(response.op()).unwrap().is_success());

        assert_eq!(verifier.calls(), 1);
        assert_eq!(verifier.seen(), vec!["j.doe".to_string()]);
        assert_eq!(metrics.binds_intercepted.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.second_factor_granted.load(Ordering::Relaxed), 1);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_service_account_passes_through() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let config = ClientConfig {
            service_accounts: vec!["svc-sync".to_string()],
            ..corp_config()
        };
        let (mut client, mut backend, handle) = spawn_session(
            config,
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );

        // Byte-identical despite the configured base DN
        let raw = bind_request_packet(3, "SVC-SYNC", "pw");
        client.write_all(&raw).await.unwrap();
        let mut seen = vec![0u8; raw.len()];
        backend.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, raw);

        backend
            .write_all(&bind_response_packet(3, ResultCode::Success.as_byte()))
            .await
            .unwrap();
        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert_eq!(response.message_id(), 3);
        assert_eq!(verifier.calls(), 0);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_first_factor_forwarded_unchanged() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let (mut client, mut backend, handle) = spawn_session(
            ClientConfig::default(),
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );
        let mut bframer = Framer::new();
        let mut cframer = Framer::new();

        client
            .write_all(&bind_request_packet(5, "j.doe", "wrong"))
            .await
            .unwrap();
        let bound = read_request(&mut bframer, &mut backend).await;
        assert_eq!(bound.op().child(1).unwrap().as_str().unwrap(), "j.doe");

        backend
            .write_all(&bind_response_packet(
                5,
                ResultCode::InvalidCredentials.as_byte(),
            ))
            .await
            .unwrap();
        let response = read_request(&mut cframer, &mut client).await;
        assert_eq!(response.message_id(), 5);
        let result = protocol::parse_ldap_result(response.op()).unwrap();
        assert_eq!(result.code, Some(ResultCode::InvalidCredentials));
        assert_eq!(verifier.calls(), 0);

        // The session stays open for another attempt
        client
            .write_all(&bind_request_packet(6, "j.doe", "right"))
            .await
            .unwrap();
        let retry = read_request(&mut bframer, &mut backend).await;
        assert_eq!(retry.message_id(), 6);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_profile_synthesizes_no_such_object() {
        let metrics = Arc::new(Metrics::new());
        let (mut client, mut backend, handle) = spawn_session(
            corp_config(),
            MockVerifier::new(AccessVerdict::Granted),
            Arc::new(SharedCaches::new()),
            metrics.clone(),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(2, "ghost", "pw"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(2, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        // Profile search returns no entry at all
        let search = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&done_packet(
                search.message_id(),
                ResultCode::Success.as_byte(),
            ))
            .await
            .unwrap();

        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert_eq!(response.message_id(), 2);
        let result = protocol::parse_ldap_result(response.op()).unwrap();
        assert_eq!(result.code, Some(ResultCode::NoSuchObject));
        assert_eq!(metrics.binds_rejected.load(Ordering::Relaxed), 1);

        // Rejection ends the session
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_access_group_miss_rejects_bind() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let config = ClientConfig {
            access_groups: vec!["VPN Users".to_string()],
            ..corp_config()
        };
        let (mut client, mut backend, handle) = spawn_session(
            config,
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(4, "j.doe", "pw"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(4, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let profile_search = read_request(&mut bframer, &mut backend).await;
        let pid = profile_search.message_id();
        backend
            .write_all(&entry_packet(pid, "CN=Jane Doe,DC=corp,DC=example", &[]))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(pid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        // Group membership comes back, but not the wanted one
        let group_search = read_request(&mut bframer, &mut backend).await;
        let gid = group_search.message_id();
        backend
            .write_all(&entry_packet(
                gid,
                "CN=Staff,OU=Groups,DC=corp,DC=example",
                &[],
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(gid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        let result = protocol::parse_ldap_result(response.op()).unwrap();
        assert_eq!(result.code, Some(ResultCode::InvalidCredentials));
        assert_eq!(verifier.calls(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bypass_group_skips_verifier() {
        let verifier = MockVerifier::new(AccessVerdict::Denied);
        let metrics = Arc::new(Metrics::new());
        let config = ClientConfig {
            second_factor_bypass_groups: vec!["MFA Exempt".to_string()],
            ..corp_config()
        };
        let (mut client, mut backend, handle) = spawn_session(
            config,
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            metrics.clone(),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(1, "j.doe", "pw"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(1, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let profile_search = read_request(&mut bframer, &mut backend).await;
        let pid = profile_search.message_id();
        backend
            .write_all(&entry_packet(pid, "CN=Jane Doe,DC=corp,DC=example", &[]))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(pid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let group_search = read_request(&mut bframer, &mut backend).await;
        let gid = group_search.message_id();
        backend
            .write_all(&entry_packet(
                gid,
                "CN=MFA Exempt,OU=Groups,DC=corp,DC=example",
                &[],
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(gid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert!(protocol::parse_ldap_result(response.op()).unwrap().is_success());
        assert_eq!(verifier.calls(), 0);
        assert_eq!(metrics.second_factor_bypassed.load(Ordering::Relaxed), 1);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_outside_mandatory_group_bypasses() {
        let verifier = MockVerifier::new(AccessVerdict::Denied);
        let config = ClientConfig {
            second_factor_groups: vec!["MFA Users".to_string()],
            ..corp_config()
        };
        let (mut client, mut backend, handle) = spawn_session(
            config,
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(1, "j.doe", "pw"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(1, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let profile_search = read_request(&mut bframer, &mut backend).await;
        let pid = profile_search.message_id();
        backend
            .write_all(&entry_packet(pid, "CN=Jane Doe,DC=corp,DC=example", &[]))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(pid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let group_search = read_request(&mut bframer, &mut backend).await;
        let gid = group_search.message_id();
        backend
            .write_all(&entry_packet(
                gid,
                "CN=Something Else,OU=Groups,DC=corp,DC=example",
                &[],
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(gid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert!(protocol::parse_ldap_result(response.op()).unwrap().is_success());
        assert_eq!(verifier.calls(), 0);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_factor_denial_rejects_bind() {
        let verifier = MockVerifier::new(AccessVerdict::Denied);
        let metrics = Arc::new(Metrics::new());
        let (mut client, mut backend, handle) = spawn_session(
            corp_config(),
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            metrics.clone(),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(9, "j.doe", "pw"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(9, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let search = read_request(&mut bframer, &mut backend).await;
        let sid = search.message_id();
        backend
            .write_all(&entry_packet(sid, "CN=Jane Doe,DC=corp,DC=example", &[]))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(sid, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert_eq!(response.message_id(), 9);
        let result = protocol::parse_ldap_result(response.op()).unwrap();
        assert_eq!(result.code, Some(ResultCode::InvalidCredentials));
        assert_eq!(verifier.calls(), 1);
        assert_eq!(metrics.second_factor_denied.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.binds_rejected.load(Ordering::Relaxed), 1);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_auth_cache_suppresses_repeat_verification() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let caches = Arc::new(SharedCaches::new());
        let metrics = Arc::new(Metrics::new());
        let config = || ClientConfig {
            auth_cache_ttl_secs: 300,
            ..corp_config()
        };

        for round in 0..2 {
            let (mut client, mut backend, handle) = spawn_session(
                config(),
                verifier.clone(),
                caches.clone(),
                metrics.clone(),
            );
            let mut bframer = Framer::new();

            client
                .write_all(&bind_request_packet(1, "j.doe", "pw"))
                .await
                .unwrap();
            let _bound = read_request(&mut bframer, &mut backend).await;
            backend
                .write_all(&bind_response_packet(1, ResultCode::Success.as_byte()))
                .await
                .unwrap();

            let search = read_request(&mut bframer, &mut backend).await;
            let sid = search.message_id();
            backend
                .write_all(&entry_packet(sid, "CN=Jane Doe,DC=corp,DC=example", &[]))
                .await
                .unwrap();
            backend
                .write_all(&done_packet(sid, ResultCode::Success.as_byte()))
                .await
                .unwrap();

            let mut cframer = Framer::new();
            let response = read_request(&mut cframer, &mut client).await;
            assert!(protocol::parse_ldap_result(response.op()).unwrap().is_success());
            assert_eq!(verifier.calls(), 1, "round {round}");

            drop(client);
            handle.await.unwrap().unwrap();
        }

        assert_eq!(metrics.second_factor_granted.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.second_factor_cached.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_login_search_correlation_feeds_dn_cache() {
        let caches = Arc::new(SharedCaches::new());
        let (mut client, mut backend, handle) = spawn_session(
            ClientConfig::default(),
            MockVerifier::new(AccessVerdict::Granted),
            caches.clone(),
            Arc::new(Metrics::new()),
        );

        let search = protocol::search_request(
            11,
            "DC=corp,DC=example",
            crate::protocol::SearchScope::WholeSubtree,
            &crate::protocol::Filter::Equality("cn".to_string(), "Jane Doe".to_string()),
            &["cn"],
        );
        client.write_all(&search.to_bytes()).await.unwrap();

        let mut bframer = Framer::new();
        let seen = read_request(&mut bframer, &mut backend).await;
        assert_eq!(seen.message_id(), 11);

        backend
            .write_all(&entry_packet(
                11,
                "CN=Jane Doe,OU=People,DC=corp,DC=example",
                &[("cn", &["Jane Doe"])],
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(11, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        // Both response packets reach the client untouched
        let mut cframer = Framer::new();
        let entry = read_request(&mut cframer, &mut client).await;
        assert_eq!(entry.message_id(), 11);
        let done = read_request(&mut cframer, &mut client).await;
        assert_eq!(done.message_id(), 11);

        assert_eq!(
            caches
                .dn_cn
                .cn_for_dn("CN=Jane Doe,OU=People,DC=corp,DC=example"),
            Some("jane doe".to_string())
        );
        assert_eq!(
            caches.dn_cn.dn_for_cn("JANE DOE"),
            Some("cn=jane doe,ou=people,dc=corp,dc=example".to_string())
        );

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_identity_format_reformats_to_upn() {
        let verifier = MockVerifier::new(AccessVerdict::Granted);
        let config = ClientConfig {
            identity_format: Some(IdentityFormat::Upn),
            ..corp_config()
        };
        let (mut client, mut backend, handle) = spawn_session(
            config,
            verifier.clone(),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );
        let mut bframer = Framer::new();

        client
            .write_all(&bind_request_packet(1, "j.doe", "pw"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(1, ResultCode::Success.as_byte()))
            .await
            .unwrap();

        let user_attrs: &[(&str, &[&str])] = &[
            ("userPrincipalName", &["j.doe@corp.example"]),
            ("uid", &["j.doe"]),
        ];

        // First lookup under the original spelling feeds the reformatting
        let first = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&entry_packet(
                first.message_id(),
                "CN=Jane Doe,DC=corp,DC=example",
                user_attrs,
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(first.message_id(), ResultCode::Success.as_byte()))
            .await
            .unwrap();

        // The reformatted name is looked up again before the decision
        let second = read_request(&mut bframer, &mut backend).await;
        assert!(second.message_id() > first.message_id());
        backend
            .write_all(&entry_packet(
                second.message_id(),
                "CN=Jane Doe,DC=corp,DC=example",
                user_attrs,
            ))
            .await
            .unwrap();
        backend
            .write_all(&done_packet(
                second.message_id(),
                ResultCode::Success.as_byte(),
            ))
            .await
            .unwrap();

        let mut cframer = Framer::new();
        let response = read_request(&mut cframer, &mut client).await;
        assert!(protocol::parse_ldap_result(response.op()).unwrap().is_success());
        assert_eq!(verifier.seen(), vec!["j.doe@corp.example".to_string()]);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bind_tarpit_delay() {
        let config = ClientConfig {
            bind_delay_min_secs: 1,
            bind_delay_max_secs: 1,
            ..Default::default()
        };
        let (mut client, mut backend, handle) = spawn_session(
            config,
            MockVerifier::new(AccessVerdict::Granted),
            Arc::new(SharedCaches::new()),
            Arc::new(Metrics::new()),
        );
        let mut bframer = Framer::new();
        let mut cframer = Framer::new();

        let begin = tokio::time::Instant::now();
        client
            .write_all(&bind_request_packet(8, "j.doe", "bad"))
            .await
            .unwrap();
        let _bound = read_request(&mut bframer, &mut backend).await;
        backend
            .write_all(&bind_response_packet(
                8,
                ResultCode::InvalidCredentials.as_byte(),
            ))
            .await
            .unwrap();

        let response = read_request(&mut cframer, &mut client).await;
        assert_eq!(response.message_id(), 8);
        assert!(begin.elapsed() >= Duration::from_secs(1));

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_member_of_any_ignores_case() {
        let groups = vec!["Staff".to_string(), "VPN Users".to_string()];
        assert!(member_of_any(&groups, &["vpn users".to_string()]));
        assert!(member_of_any(&groups, &["STAFF".to_string()]));
        assert!(!member_of_any(&groups, &["Admins".to_string()]));
        assert!(!member_of_any(&[], &["Staff".to_string()]));
    }
}
