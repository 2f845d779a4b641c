use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

use crate::chunks::{create_chunks, Reassembler};
use crate::compress::CompressionPipeline;
use crate::config::SocketConfig;
use crate::dispatcher::MessageDispatcher;
use crate::envelope::{body_checksum, CodecId, Envelope, Flags, MessageType};
use crate::error::ProtocolError;
use crate::message_id::{chunk_id, split_chunk_id, MessageIdGenerator};
use crate::send_socket::SendSocket;
use crate::tracker::{RequestTracker, ResolveCallback, TimeoutCallback};

/// Tick of the garbage collection task sweeping stale assemblies and old
/// tracker entries.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Age beyond which the GC removes a tracker entry, independent of the
/// per-request timeout. Safety net for entries whose timers got lost.
const REQUEST_CLEANUP_AGE: Duration = Duration::from_secs(60);

struct EngineParams {
    config: Arc<SocketConfig>,
    pipeline: Arc<CompressionPipeline>,
}

/// Both halves of the datagram socket. Taken out and dropped on `close()` so
/// the bound port is actually released, not just logically gated off.
struct Sockets {
    receive: Arc<UdpSocket>,
    send: Arc<dyn SendSocket>,
}

/// ReliableSocket is the place where all parts of the protocol come together:
///  it turns the unreliable datagram socket underneath into a request/response
///  primitive with at-least-once delivery, transparent chunking of oversized
///  payloads and optional compression.
///
/// All shared state (outstanding requests, partial reassemblies) is owned
/// here and only ever mutated behind the internal locks; no lock is exposed
/// to the application, and no application callback runs while one is held.
pub struct ReliableSocket {
    params: std::sync::RwLock<EngineParams>,
    sockets: std::sync::RwLock<Option<Sockets>>,
    self_addr: SocketAddr,
    id_generator: MessageIdGenerator,
    tracker: RequestTracker,
    reassembler: Mutex<Reassembler>,
    dispatcher: Arc<dyn MessageDispatcher>,
    cleanup_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl ReliableSocket {
    pub async fn bind(
        config: SocketConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<ReliableSocket>> {
        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);

        Self::new(config, socket.clone(), Arc::new(socket), dispatcher)
    }

    fn new(
        config: SocketConfig,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<ReliableSocket>> {
        config.validate()?;

        let self_addr = receive_socket.local_addr()?;
        let engine = Arc::new(ReliableSocket {
            id_generator: MessageIdGenerator::new(config.worker_id)?,
            params: std::sync::RwLock::new(EngineParams {
                pipeline: Arc::new(CompressionPipeline::new(config.compression.clone())),
                config: Arc::new(config),
            }),
            sockets: std::sync::RwLock::new(Some(Sockets {
                receive: receive_socket,
                send: send_socket,
            })),
            self_addr,
            tracker: RequestTracker::new(),
            reassembler: Mutex::new(Reassembler::new()),
            dispatcher,
            cleanup_task: std::sync::Mutex::new(None),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let cleanup = Self::spawn_cleanup_task(&engine);
        *engine.cleanup_task.lock().expect("cleanup task slot poisoned") = Some(cleanup);

        Ok(engine)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.self_addr
    }

    fn send_half(&self) -> Option<Arc<dyn SendSocket>> {
        self.sockets.read().expect("socket slot poisoned")
            .as_ref()
            .map(|sockets| sockets.send.clone())
    }

    fn receive_half(&self) -> Option<Arc<UdpSocket>> {
        self.sockets.read().expect("socket slot poisoned")
            .as_ref()
            .map(|sockets| sockets.receive.clone())
    }

    /// Re-keys the engine with new parameters. The bound address and the
    /// worker id of the id generator are fixed at bind time; everything else
    /// takes effect for subsequent sends and receives. Timers already armed
    /// keep the durations they were armed with.
    pub fn configure(&self, config: SocketConfig) -> anyhow::Result<()> {
        config.validate()?;

        let mut params = self.params.write().expect("engine params poisoned");
        params.pipeline = Arc::new(CompressionPipeline::new(config.compression.clone()));
        params.config = Arc::new(config);
        Ok(())
    }

    fn params(&self) -> (Arc<SocketConfig>, Arc<CompressionPipeline>) {
        let params = self.params.read().expect("engine params poisoned");
        (params.config.clone(), params.pipeline.clone())
    }

    /// Sends a request and resolves when the exchange completes: with the
    /// response body once a RES arrives, or with None once every chunk of an
    /// oversized payload is acknowledged. Fails with
    /// [`ProtocolError::RequestTimeout`] when the peer stays silent past
    /// `request_timeout`.
    pub async fn send(self: &Arc<Self>, message: &Value, to: SocketAddr) -> anyhow::Result<Option<Value>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed.into());
        }
        let (config, pipeline) = self.params();

        let serialized = serde_json::to_vec(message)?;
        let (completion, rx) = CompletionSlot::new();

        match pipeline.try_compress(&serialized) {
            Some(result) => {
                let sizes = (result.original_size as u64, result.compressed_size as u64);
                if result.compressed_size <= config.max_message_size {
                    let body = Value::String(result.to_base64());
                    self.send_single_request(body, result.codec, Some(sizes), to, &config, completion).await?;
                }
                else {
                    self.send_chunked_request(result.data, result.codec, Some(sizes), to, &config, completion).await?;
                }
            }
            None => {
                if serialized.len() <= config.max_message_size {
                    self.send_single_request(message.clone(), CodecId::None, None, to, &config, completion).await?;
                }
                else {
                    self.send_chunked_request(Bytes::from(serialized), CodecId::None, None, to, &config, completion).await?;
                }
            }
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtocolError::Closed.into()),
        }
    }

    /// Sends the response for a previously delivered request. Responses are
    /// not retransmitted: a lost response surfaces as a timeout on the
    /// requester, whose retry re-delivers the request.
    pub async fn send_response(&self, request_id: &str, message: &Value, to: SocketAddr) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed.into());
        }
        let (config, pipeline) = self.params();

        let serialized = serde_json::to_vec(message)?;
        let (body, codec, sizes) = match pipeline.try_compress(&serialized) {
            Some(result) => (
                Value::String(result.to_base64()),
                result.codec,
                Some((result.original_size as u64, result.compressed_size as u64)),
            ),
            None => (message.clone(), CodecId::None, None),
        };

        let flags = Flags {
            message_type: MessageType::Response,
            codec,
            compressed: sizes.is_some(),
            chunked: false,
        };
        let envelope = Envelope {
            id: request_id.to_string(),
            checksum: config.enable_checksum.then(|| body_checksum(&body)),
            body: Some(body),
            flags: flags.encode(),
            ci: None,
            ct: None,
            os: sizes.map(|(os, _)| os),
            cs: sizes.map(|(_, cs)| cs),
        };

        let Some(send_socket) = self.send_half() else {
            return Err(ProtocolError::Closed.into());
        };
        debug!("sending response for {} to {:?}", request_id, to);
        send_socket.do_send_datagram(to, &envelope.serialize()?).await;
        Ok(())
    }

    async fn send_single_request(
        self: &Arc<Self>,
        body: Value,
        codec: CodecId,
        sizes: Option<(u64, u64)>,
        to: SocketAddr,
        config: &Arc<SocketConfig>,
        completion: Arc<CompletionSlot>,
    ) -> anyhow::Result<()> {
        let id = self.id_generator.generate()?.to_string();

        let flags = Flags {
            message_type: MessageType::Request,
            codec,
            compressed: sizes.is_some(),
            chunked: false,
        };
        let envelope = Envelope {
            id: id.clone(),
            checksum: config.enable_checksum.then(|| body_checksum(&body)),
            body: Some(body),
            flags: flags.encode(),
            ci: None,
            ct: None,
            os: sizes.map(|(os, _)| os),
            cs: sizes.map(|(_, cs)| cs),
        };
        let buf = Bytes::from(envelope.serialize()?);

        debug!("sending request {} to {:?} ({} bytes)", id, to, buf.len());

        let on_resolve: ResolveCallback = {
            let completion = completion.clone();
            Box::new(move |value| completion.complete(Ok(value)))
        };
        let on_timeout: TimeoutCallback = {
            let id = id.clone();
            Box::new(move || completion.complete(Err(ProtocolError::RequestTimeout(id))))
        };
        self.tracker.register(id.clone(), config.request_timeout, on_resolve, on_timeout).await;

        self.send_and_arm_retry(buf, id, to, config.clone()).await;
        Ok(())
    }

    async fn send_chunked_request(
        self: &Arc<Self>,
        payload: Bytes,
        codec: CodecId,
        sizes: Option<(u64, u64)>,
        to: SocketAddr,
        config: &Arc<SocketConfig>,
        completion: Arc<CompletionSlot>,
    ) -> anyhow::Result<()> {
        let base_id = self.id_generator.generate()?.to_string();
        let chunks = create_chunks(&payload, config.chunk_size);
        let total = chunks.len() as u32;

        debug!("sending request {} to {:?} in {} chunks", base_id, to, total);

        // the logical send completes when the last chunk is acknowledged and
        // fails as soon as any one chunk times out
        let unacked = Arc::new(AtomicU32::new(total));

        for (index, chunk) in chunks.into_iter().enumerate() {
            let index = index as u32;
            let first = index == 0;
            let id = chunk_id(&base_id, index);

            // every chunk carries the codec bits so arrival order cannot
            // affect which codec the receiver records; the compressed bit and
            // the sizes go on chunk 0 only
            let flags = Flags {
                message_type: MessageType::Request,
                codec,
                compressed: first && sizes.is_some(),
                chunked: true,
            };
            let body = Value::String(chunk);
            let envelope = Envelope {
                id: id.clone(),
                checksum: config.enable_checksum.then(|| body_checksum(&body)),
                body: Some(body),
                flags: flags.encode(),
                ci: Some(index),
                ct: Some(total),
                os: if first { sizes.map(|(os, _)| os) } else { None },
                cs: if first { sizes.map(|(_, cs)| cs) } else { None },
            };
            let buf = Bytes::from(envelope.serialize()?);

            let on_resolve: ResolveCallback = {
                let completion = completion.clone();
                let unacked = unacked.clone();
                Box::new(move |_| {
                    if unacked.fetch_sub(1, Ordering::SeqCst) == 1 {
                        completion.complete(Ok(None));
                    }
                })
            };
            let on_timeout: TimeoutCallback = {
                let completion = completion.clone();
                let base_id = base_id.clone();
                Box::new(move || completion.complete(Err(ProtocolError::RequestTimeout(base_id))))
            };
            self.tracker.register(id.clone(), config.request_timeout, on_resolve, on_timeout).await;

            self.send_and_arm_retry(buf, id, to, config.clone()).await;
        }
        Ok(())
    }

    /// Emits the datagram, then arms a retry timer unless the envelope is
    /// already acknowledged or out of retries. A retry reuses the same
    /// envelope bytes and id. Exhausting the retries does not fail the
    /// request - the request timeout is the final deadline, the retry counter
    /// only caps wire traffic.
    fn send_and_arm_retry(
        self: &Arc<Self>,
        buf: Bytes,
        id: String,
        to: SocketAddr,
        config: Arc<SocketConfig>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let this = self.clone();
        Box::pin(async move {
            let Some(send_socket) = this.send_half() else {
                return;
            };
            send_socket.do_send_datagram(to, &buf).await;

            let Some((acked, retry_count)) = this.tracker.retry_state(&id).await else {
                return;
            };
            if acked {
                return;
            }
            if retry_count >= config.max_retries {
                debug!("request {} exhausted its {} retries, awaiting timeout", id, config.max_retries);
                return;
            }

            let timer = {
                let this = this.clone();
                let config = config.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(config.retry_interval).await;
                    let Some(count) = this.tracker.increment_retry(&id).await else {
                        return;
                    };
                    debug!("retrying request {} (attempt {})", id, count);
                    // indirection because the retry recursion would otherwise
                    // make this future infinitely sized
                    this.send_and_arm_retry(buf, id, to, config).await;
                })
            };
            this.tracker.set_retry_timer(&id, timer).await;
        })
    }

    /// Receives datagrams until the engine is closed. Run this on its own
    /// task; everything the engine does on receipt happens from here, so all
    /// protocol state is mutated from a single task context.
    pub async fn recv_loop(self: &Arc<Self>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; 65536];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                info!("shutting down receive loop");
                return;
            }

            // a fresh clone per iteration, so close() dropping the engine's
            // handles leaves at most this one, released on the next wakeup
            let Some(receive_socket) = self.receive_half() else {
                info!("shutting down receive loop");
                return;
            };

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("shutting down receive loop");
                    return;
                }
                received = receive_socket.recv_from(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => {
                            x
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };

                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                    let _entered = span.enter();

                    trace!("received {} bytes from {:?}", num_read, from);
                    self.handle_datagram(&buf[..num_read], from).instrument(Span::current()).await;
                }
            }
        }
    }

    pub(crate) async fn handle_datagram(self: &Arc<Self>, buf: &[u8], from: SocketAddr) {
        let Some(envelope) = Envelope::parse(buf) else {
            trace!("datagram from {:?} is not a protocol envelope - passing through", from);
            self.dispatcher.on_passthrough(Bytes::copy_from_slice(buf), from).await;
            return;
        };

        let Some(flags) = Flags::decode(envelope.flags) else {
            debug!("envelope {} carries unknown flags {:#04x} - passing through", envelope.id, envelope.flags);
            self.dispatcher.on_passthrough(Bytes::copy_from_slice(buf), from).await;
            return;
        };

        match flags.message_type {
            MessageType::Request => self.handle_request(envelope, flags, from).await,
            MessageType::Ack => self.handle_ack(envelope).await,
            MessageType::Response => self.handle_response(envelope, flags).await,
        }
    }

    async fn handle_request(self: &Arc<Self>, envelope: Envelope, flags: Flags, from: SocketAddr) {
        let (config, pipeline) = self.params();

        if !verify_checksum(&envelope, &config) {
            return;
        }

        // receipt is acknowledged before any application work happens, so
        // the sender stops retrying even when the handler is slow
        self.send_ack(&envelope.id, from).await;

        if flags.chunked {
            self.handle_request_chunk(envelope, flags, from, &pipeline).await;
        }
        else {
            let body = envelope.body.unwrap_or(Value::Null);
            let value = if flags.compressed {
                let Value::String(data) = &body else {
                    warn!("compressed request {} body is not a string - dropping", envelope.id);
                    return;
                };
                match pipeline.try_decompress(data, flags.codec) {
                    Some(value) => value,
                    None => {
                        warn!("cannot deliver request {}: decompression failed", envelope.id);
                        return;
                    }
                }
            }
            else {
                body
            };

            self.dispatcher.on_message(value, from, envelope.id).await;
        }
    }

    async fn handle_request_chunk(
        &self,
        envelope: Envelope,
        flags: Flags,
        from: SocketAddr,
        pipeline: &CompressionPipeline,
    ) {
        let Some((base_id, index_from_id)) = split_chunk_id(&envelope.id) else {
            warn!("chunked request {} has no -chunk- suffix - dropping", envelope.id);
            return;
        };
        // the structured fields are authoritative when present, the id
        // suffix is the fallback for older peers
        let index = envelope.ci.unwrap_or(index_from_id);
        let Some(total) = envelope.ct else {
            warn!("chunk {} carries no chunk total - dropping", envelope.id);
            return;
        };
        let Some(Value::String(data)) = envelope.body else {
            warn!("chunk {} body is not a string - dropping", envelope.id);
            return;
        };

        let assembled = {
            let mut reassembler = self.reassembler.lock().await;
            if !reassembler.has_assembly(base_id) {
                reassembler.init_assembly(base_id, total, from, flags.codec);
            }
            if reassembler.add_chunk(base_id, index, data) {
                reassembler.take_assembled(base_id)
            }
            else {
                None
            }
        };

        let Some((bytes, codec, remote)) = assembled else {
            return;
        };
        debug!("message {} reassembled, {} bytes", base_id, bytes.len());

        let payload = if codec == CodecId::None {
            bytes.to_vec()
        }
        else {
            match pipeline.decompress_raw(&bytes, codec) {
                Some(payload) => payload,
                None => {
                    warn!("cannot deliver message {}: decompression failed", base_id);
                    return;
                }
            }
        };

        match serde_json::from_slice(&payload) {
            Ok(value) => self.dispatcher.on_message(value, remote, base_id.to_string()).await,
            Err(e) => warn!("reassembled message {} is not a valid value - dropping: {}", base_id, e),
        }
    }

    async fn handle_ack(&self, envelope: Envelope) {
        if split_chunk_id(&envelope.id).is_some() {
            // chunk entries resolve on their ack; the logical send completes
            // when the last one does
            if self.tracker.invoke_and_remove(&envelope.id, None).await {
                debug!("chunk {} acknowledged", envelope.id);
            }
            else {
                debug!("ack for unknown chunk {} - ignoring", envelope.id);
            }
        }
        else if self.tracker.mark_acked(&envelope.id).await {
            debug!("request {} acknowledged", envelope.id);
        }
        else {
            debug!("ack for unknown request {} - ignoring", envelope.id);
        }
    }

    async fn handle_response(&self, envelope: Envelope, flags: Flags) {
        let (config, pipeline) = self.params();

        if !verify_checksum(&envelope, &config) {
            return;
        }

        let body = envelope.body.unwrap_or(Value::Null);
        let value = if flags.compressed {
            let Value::String(data) = &body else {
                warn!("compressed response {} body is not a string - dropping", envelope.id);
                return;
            };
            match pipeline.try_decompress(data, flags.codec) {
                Some(value) => value,
                None => {
                    warn!("cannot deliver response {}: decompression failed", envelope.id);
                    return;
                }
            }
        }
        else {
            body
        };

        if !self.tracker.invoke_and_remove(&envelope.id, Some(value)).await {
            debug!("response for unknown request {} - ignoring", envelope.id);
        }
    }

    async fn send_ack(&self, id: &str, to: SocketAddr) {
        let flags = Flags {
            message_type: MessageType::Ack,
            codec: CodecId::None,
            compressed: false,
            chunked: false,
        };
        let envelope = Envelope {
            id: id.to_string(),
            body: None,
            checksum: None,
            flags: flags.encode(),
            ci: None,
            ct: None,
            os: None,
            cs: None,
        };

        let Some(send_socket) = self.send_half() else {
            debug!("not acknowledging {} - socket closed", id);
            return;
        };
        match envelope.serialize() {
            Ok(buf) => send_socket.do_send_datagram(to, &buf).await,
            Err(e) => error!("could not serialize ack for {}: {}", id, e),
        }
    }

    fn spawn_cleanup_task(engine: &Arc<ReliableSocket>) -> JoinHandle<()> {
        // the task must not keep the engine alive, so it holds a weak
        // reference and dies with the last strong one
        let engine = Arc::downgrade(engine);
        tokio::spawn(async move {
            let mut tick = interval(CLEANUP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;

                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let (config, _) = engine.params();
                let stale = engine.reassembler.lock().await.cleanup_stale(config.reassembly_timeout);
                let old = engine.tracker.cleanup_old(REQUEST_CLEANUP_AGE).await;
                if stale + old > 0 {
                    debug!("cleanup removed {} stale assemblies and {} old requests", stale, old);
                }
            }
        })
    }

    /// Full teardown: stops the cleanup tick and the receive loop, clears
    /// all tracker entries without invoking callbacks, clears the assembly
    /// map, then drops the socket handles so the bound port is released.
    /// Outstanding sends observe the closed socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing reliable socket");

        self.shutdown.notify_one();
        if let Some(task) = self.cleanup_task.lock().expect("cleanup task slot poisoned").take() {
            task.abort();
        }
        self.tracker.clear().await;
        self.reassembler.lock().await.clear();

        // the socket goes last; a receive loop still parked on it wakes up
        // through the notification above and drops its own clone
        self.sockets.write().expect("socket slot poisoned").take();
    }
}

fn verify_checksum(envelope: &Envelope, config: &SocketConfig) -> bool {
    if !config.enable_checksum {
        return true;
    }
    let Some(expected) = &envelope.checksum else {
        return true;
    };
    let Some(body) = &envelope.body else {
        warn!("envelope {} carries a checksum but no body - dropping", envelope.id);
        return false;
    };

    if &body_checksum(body) != expected {
        warn!("checksum mismatch on {} - dropping, sender will retry", envelope.id);
        return false;
    }
    true
}

type SendOutcome = Result<Option<Value>, ProtocolError>;

/// One-shot completion shared between the resolve and timeout callbacks of a
/// send (and between all chunk callbacks of a chunked send): whichever fires
/// first wins, everything after is a no-op.
struct CompletionSlot {
    tx: std::sync::Mutex<Option<oneshot::Sender<SendOutcome>>>,
}

impl CompletionSlot {
    fn new() -> (Arc<CompletionSlot>, oneshot::Receiver<SendOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(CompletionSlot {
                tx: std::sync::Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn complete(&self, outcome: SendOutcome) {
        let tx = self.tx.lock().expect("completion slot poisoned").take();
        if let Some(tx) = tx {
            if tx.send(outcome).is_err() {
                debug!("send completion receiver dropped before resolution");
            }
        }
    }
}
