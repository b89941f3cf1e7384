//! # Stream Handler
//!
//! Drives the protocol with one connected unit and exposes the timeout-bound
//! `execute` used by the orchestrator.
//!
//! ## Lifecycle
//!
//! 1. The unit's first message must be REGISTER carrying its [`ChaincodeId`].
//! 2. The handler registers itself under the canonical name, replies
//!    REGISTERED then READY, and marks the launch as ready.
//! 3. Terminal messages (COMPLETED, ERROR) are routed to the pending slot of
//!    their `(channel, txid)`. Anything else the unit asks for is refused.
//! 4. When the stream ends the handler deregisters itself and fails every
//!    pending slot.
//!
//! ## Invariants
//!
//! - A pending slot is removed exactly once: by its response, or by the
//!   execute call that created it (timeout, cancellation, send failure, drop).
//! - `timeout` and `cancel` bound the whole execute, the send included.
//! - A late response for a removed slot is logged and discarded.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ccwire::ChaincodeId;
use ccwire::ChaincodeMessage;
use ccwire::MessageType;
use ccwire::Record;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ccprovider::CCContext;
use crate::error::HandlerError;
use crate::registry::HandlerRegistry;
use crate::stream::ChaincodeStream;

/// The registry's view of a connected unit.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Canonical name the unit registered under.
    fn chaincode_name(&self) -> &str;

    /// Sends `msg` and waits for the terminal message answering it.
    ///
    /// Returns early with [`HandlerError::Cancelled`] once `cancel` fires and
    /// with [`HandlerError::Timeout`] after `timeout`.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        msg: ChaincodeMessage,
        timeout: Duration,
    ) -> Result<ChaincodeMessage, HandlerError>;
}

/// Produces correlation ids for peer-originated messages.
pub type UuidGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn default_uuid_generator() -> UuidGenerator {
    Arc::new(|| uuid::Uuid::new_v4().to_string())
}

#[derive(Clone)]
pub struct StreamOptions {
    /// Interval between KEEPALIVE messages; `None` disables them.
    pub keepalive: Option<Duration>,
    pub uuid: UuidGenerator,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { keepalive: None, uuid: default_uuid_generator() }
    }
}

type TxKey = (String, String);

struct Pending {
    seq: u64,
    tx: oneshot::Sender<Result<ChaincodeMessage, HandlerError>>,
}

/// Removes its own pending slot when the execute call ends, however it ends.
struct PendingSlot<'a> {
    pending: &'a DashMap<TxKey, Pending>,
    key: TxKey,
    seq: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove_if(&self.key, |_, p| p.seq == self.seq);
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct StreamHandler {
    chaincode_name: String,
    stream: Arc<dyn ChaincodeStream>,
    pending: DashMap<TxKey, Pending>,
    seq_gen: AtomicU64,
    closed: AtomicBool,
}

impl StreamHandler {
    /// Serves one unit connection until the stream ends.
    ///
    /// Returns `Ok` on a clean close after registration, and the reason
    /// otherwise. The handler is deregistered in either case.
    pub async fn serve(
        stream: Arc<dyn ChaincodeStream>,
        registry: Arc<HandlerRegistry>,
        opts: StreamOptions,
    ) -> Result<(), HandlerError> {
        let register = match stream.recv().await? {
            Some(msg) => msg,
            None => return Err(HandlerError::ClosedBeforeRegister),
        };

        if register.message_type != MessageType::Register {
            let reason = format!(
                "chaincode handler cannot handle message ({}) while in created state",
                register.message_type
            );
            reply_error(stream.as_ref(), &register, reason).await;
            return Err(HandlerError::UnexpectedHandshake(register.message_type));
        }

        let chaincode_id = match ChaincodeId::from_bytes(&register.payload) {
            Ok(id) => id,
            Err(e) => {
                reply_error(stream.as_ref(), &register, format!("malformed chaincode id: {}", e)).await;
                return Err(HandlerError::MalformedRegistration(e));
            }
        };
        let cname = chaincode_id.canonical_name();

        let handler = Arc::new(StreamHandler {
            chaincode_name: cname.clone(),
            stream: stream.clone(),
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let as_handler: Arc<dyn Handler> = handler.clone();

        if let Err(e) = registry.register(as_handler.clone()) {
            tracing::warn!(chaincode = %cname, error = %e, "registration rejected");
            reply_error(stream.as_ref(), &register, e.to_string()).await;
            return Err(e.into());
        }
        tracing::debug!(chaincode = %cname, "got REGISTER, sending REGISTERED");

        let result = handler.run(&register, &registry, &opts).await;

        handler.closed.store(true, Ordering::SeqCst);
        registry.deregister_handler(&cname, &as_handler);
        handler.fail_pending();

        match &result {
            Ok(()) => tracing::info!(chaincode = %cname, "chaincode stream closed"),
            Err(e) => tracing::warn!(chaincode = %cname, error = %e, "chaincode stream failed"),
        }
        result
    }

    async fn run(
        &self,
        register: &ChaincodeMessage,
        registry: &HandlerRegistry,
        opts: &StreamOptions,
    ) -> Result<(), HandlerError> {
        let registered =
            ChaincodeMessage::new(MessageType::Registered, "", register.txid.clone(), Vec::new());
        self.stream.send(&registered).await?;
        let ready = ChaincodeMessage::new(MessageType::Ready, "", "", Vec::new());
        self.stream.send(&ready).await?;
        registry.ready(&self.chaincode_name);

        let _keepalive = opts
            .keepalive
            .filter(|interval| !interval.is_zero())
            .map(|interval| self.spawn_keepalive(interval, opts.uuid.clone()));

        loop {
            let Some(msg) = self.stream.recv().await? else {
                return Ok(());
            };

            match msg.message_type {
                MessageType::Completed | MessageType::Error => self.notify(msg),
                MessageType::Keepalive => {}
                other => {
                    tracing::debug!(
                        chaincode = %self.chaincode_name,
                        channel = %msg.channel_id,
                        txid = %msg.txid,
                        message_type = %other,
                        "refusing unsupported request"
                    );
                    reply_error(self.stream.as_ref(), &msg, format!("{} not supported", other)).await;
                }
            }
        }
    }

    fn spawn_keepalive(&self, interval: Duration, uuid: UuidGenerator) -> AbortOnDrop {
        let stream = self.stream.clone();
        let cname = self.chaincode_name.clone();
        AbortOnDrop(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let msg = ChaincodeMessage::new(MessageType::Keepalive, "", uuid(), Vec::new());
                if let Err(e) = stream.send(&msg).await {
                    tracing::debug!(chaincode = %cname, error = %e, "keepalive stopped");
                    break;
                }
            }
        }))
    }

    fn notify(&self, msg: ChaincodeMessage) {
        let key = (msg.channel_id.clone(), msg.txid.clone());
        match self.pending.remove(&key) {
            Some((_, pending)) => {
                let _ = pending.tx.send(Ok(msg));
            }
            None => tracing::warn!(
                chaincode = %self.chaincode_name,
                channel = %key.0,
                txid = %key.1,
                message_type = %msg.message_type,
                "discarding response for unknown transaction"
            ),
        }
    }

    fn fail_pending(&self) {
        let keys: Vec<TxKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.tx.send(Err(HandlerError::Disconnected(self.chaincode_name.clone())));
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler for StreamHandler {
    fn chaincode_name(&self) -> &str {
        &self.chaincode_name
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        msg: ChaincodeMessage,
        timeout: Duration,
    ) -> Result<ChaincodeMessage, HandlerError> {
        let txid = msg.txid.clone();
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled { txid });
        }

        let key = (msg.channel_id.clone(), msg.txid.clone());
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(HandlerError::DuplicateTransaction { channel_id: key.0, txid });
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending { seq, tx });
            }
        }
        let _slot = PendingSlot { pending: &self.pending, key, seq };

        if self.closed.load(Ordering::SeqCst) {
            return Err(HandlerError::Disconnected(self.chaincode_name.clone()));
        }

        tracing::debug!(
            chaincode = %self.chaincode_name,
            channel = %cccid.chain_id,
            txid = %txid,
            message_type = %msg.message_type,
            "sending to chaincode"
        );
        let deadline = tokio::time::Instant::now() + timeout;
        let exchange = async {
            match self.stream.send(&msg).await {
                Ok(()) => rx
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::Disconnected(self.chaincode_name.clone()))),
                Err(e) => Err(HandlerError::from(e)),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandlerError::Cancelled { txid }),
            result = exchange => result,
            _ = tokio::time::sleep_until(deadline) => Err(HandlerError::Timeout { txid, timeout }),
        }
    }
}

async fn reply_error(stream: &dyn ChaincodeStream, to: &ChaincodeMessage, reason: String) {
    let reply = ChaincodeMessage::new(
        MessageType::Error,
        to.channel_id.clone(),
        to.txid.clone(),
        reason.into_bytes(),
    );
    if let Err(e) = stream.send(&reply).await {
        tracing::debug!(txid = %to.txid, error = %e, "failed to send ERROR reply");
    }
}
