use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast, mpsc};

use lecturecart::{
    api::{
        ApiError, BatchAck, BatchApi, BatchCommand, BatchEvent, BatchLogEntry, BatchLogs,
        BatchStream, EnqueueRequest,
    },
    core::store::{CartStore, PersistedState},
    engine::{
        EngineConfig,
        cart::{CartEngine, RunOptions, RunOutcome},
        pending::EngineCommand,
    },
    error::CartError,
    item::ItemDraft,
    runtime::{
        events::{CartEvent, NoticeKind},
        handle::{CartHandle, RuntimeConfig, spawn_cart},
    },
    types::{BatchId, ItemId, ItemState, LogLevel, OnCompletion},
};

type Payloads = mpsc::UnboundedSender<Result<String, ApiError>>;

#[derive(Default)]
struct FakeApi {
    enqueued: Mutex<Vec<EnqueueRequest>>,
    controls: Mutex<Vec<(BatchId, BatchCommand)>>,
    reorders: Mutex<Vec<(BatchId, Vec<ItemId>)>>,
    reordered: Notify,
    log_fetches: AtomicUsize,
    catch_up: Mutex<BatchLogs>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<Result<String, ApiError>>>>,
    reject_enqueue: AtomicBool,
    fail_control: AtomicBool,
    fail_reorder: AtomicBool,
    enqueue_gate: Option<Arc<Notify>>,
}

impl FakeApi {
    fn with_stream() -> (Arc<Self>, Payloads) {
        let (tx, rx) = mpsc::unbounded_channel();
        let api = Self {
            stream: Mutex::new(Some(rx)),
            ..Self::default()
        };
        (Arc::new(api), tx)
    }

    fn calls(&self) -> usize {
        self.enqueued.lock().expect("lock").len()
            + self.controls.lock().expect("lock").len()
            + self.reorders.lock().expect("lock").len()
            + self.log_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchApi for FakeApi {
    async fn enqueue_batch(&self, request: &EnqueueRequest) -> Result<BatchAck, ApiError> {
        if let Some(gate) = &self.enqueue_gate {
            gate.notified().await;
        }
        self.enqueued.lock().expect("lock").push(request.clone());
        Ok(BatchAck {
            id: BatchId::from("b-100"),
            accepted: !self.reject_enqueue.load(Ordering::SeqCst),
            status: self
                .reject_enqueue
                .load(Ordering::SeqCst)
                .then(|| "quota exceeded".to_string()),
            validated: request.dry_run.map(|_| request.tasks.len()),
        })
    }

    async fn update_batch(
        &self,
        batch_id: &BatchId,
        command: BatchCommand,
    ) -> Result<BatchAck, ApiError> {
        if self.fail_control.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.controls
            .lock()
            .expect("lock")
            .push((batch_id.clone(), command));
        Ok(BatchAck {
            id: batch_id.clone(),
            accepted: true,
            status: None,
            validated: None,
        })
    }

    async fn reorder_batch(&self, batch_id: &BatchId, order: &[ItemId]) -> Result<(), ApiError> {
        self.reorders
            .lock()
            .expect("lock")
            .push((batch_id.clone(), order.to_vec()));
        self.reordered.notify_one();
        if self.fail_reorder.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected("stale order".to_string()));
        }
        Ok(())
    }

    async fn fetch_batch_logs(&self, _batch_id: &BatchId) -> Result<BatchLogs, ApiError> {
        self.log_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.catch_up.lock().expect("lock").clone())
    }

    async fn open_batch_stream(&self, _batch_id: &BatchId) -> Result<BatchStream, ApiError> {
        let rx = self
            .stream
            .lock()
            .expect("lock")
            .take()
            .ok_or_else(|| ApiError::Stream("already open".to_string()))?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

fn engine_with(api: Option<Arc<FakeApi>>) -> (CartEngine, CartHandle) {
    let handle = spawn_cart(CartStore::new(), None, RuntimeConfig::default());
    let api = api.map(|a| a as Arc<dyn BatchApi>);
    (
        CartEngine::new(handle.clone(), api, EngineConfig::default()),
        handle,
    )
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<CartEvent>, mut pred: F) -> CartEvent
where
    F: FnMut(&CartEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_closed(tx: &Payloads) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !tx.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream was not closed");
}

fn event_json(event: &BatchEvent) -> String {
    serde_json::to_string(event).expect("encode")
}

#[tokio::test]
async fn empty_cart_fails_validation_without_network() {
    let (api, _tx) = FakeApi::with_stream();
    let (engine, _handle) = engine_with(Some(Arc::clone(&api)));
    let mut sub = engine.subscribe();

    let err = engine.run(RunOptions::default()).await.expect_err("empty cart");
    assert!(matches!(&err, CartError::Validation(msg) if msg == "cart is empty"));
    assert_eq!(api.calls(), 0);

    match next_matching(&mut sub, |e| matches!(e, CartEvent::Notice(_))).await {
        CartEvent::Notice(notice) => {
            assert_eq!(notice.kind, NoticeKind::Error);
            assert_eq!(notice.title, "Check your cart");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn dry_run_reports_count_without_starting() {
    let (api, _tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    for n in 0..3 {
        handle
            .add_item(ItemDraft::new(format!("L{n}"), "transcribe"))
            .await
            .expect("add");
    }

    let outcome = engine.dry_run().await.expect("dry run");
    assert_eq!(outcome, RunOutcome::Validated { count: 3 });

    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert!(snap.active_batch_id.is_none());
    let enqueued = api.enqueued.lock().expect("lock");
    assert_eq!(enqueued[0].dry_run, Some(true));
    assert_eq!(enqueued[0].tasks.len(), 3);
}

#[tokio::test]
async fn run_reconciles_catch_up_then_live_events_until_completed() {
    let (api, tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    let a = handle
        .add_item(ItemDraft::new("Week 1 audio", "transcribe"))
        .await
        .expect("add");
    let b = handle
        .add_item(ItemDraft::new("Week 1 slides", "process_slides"))
        .await
        .expect("add");

    *api.catch_up.lock().expect("lock") = BatchLogs {
        entries: vec![
            BatchLogEntry {
                id: None,
                item_id: Some(a),
                timestamp: None,
                level: Some(LogLevel::Info),
                message: Some("queued".to_string()),
                state: Some(ItemState::Queued),
            },
            BatchLogEntry {
                id: None,
                item_id: Some(a),
                timestamp: None,
                level: None,
                message: Some("worker picked up".to_string()),
                state: Some(ItemState::Running),
            },
        ],
    };

    let mut sub = engine.subscribe();
    let outcome = engine
        .run(RunOptions {
            dry_run: false,
            preset_name: Some("weekly".to_string()),
        })
        .await
        .expect("run");
    let batch_id = BatchId::from("b-100");
    assert_eq!(
        outcome,
        RunOutcome::Started {
            batch_id: batch_id.clone()
        }
    );

    let snap = handle.snapshot().await.expect("snapshot");
    assert!(snap.running);
    assert_eq!(snap.active_batch_id.as_ref(), Some(&batch_id));
    assert_eq!(
        api.enqueued.lock().expect("lock")[0].preset_name.as_deref(),
        Some("weekly")
    );

    tx.send(Ok(event_json(&BatchEvent {
        item_id: Some(a),
        message: Some("transcribed".to_string()),
        state: Some(ItemState::Success),
        ..BatchEvent::default()
    })))
    .expect("send");
    tx.send(Ok("{not json".to_string())).expect("send");
    tx.send(Ok(event_json(&BatchEvent {
        item_id: Some(b),
        level: Some(LogLevel::Error),
        message: Some("ocr crashed".to_string()),
        state: Some(ItemState::Error),
        est_ms: Some(7000),
        ..BatchEvent::default()
    })))
    .expect("send");
    tx.send(Ok(event_json(&BatchEvent {
        batch_state: Some(BatchEvent::COMPLETED.to_string()),
        ..BatchEvent::default()
    })))
    .expect("send");

    next_matching(&mut sub, |e| matches!(e, CartEvent::BatchCompleted { .. })).await;
    match next_matching(&mut sub, |e| matches!(e, CartEvent::Notice(_))).await {
        CartEvent::Notice(notice) => {
            assert_eq!(notice.kind, NoticeKind::Success);
            assert_eq!(notice.title, "Batch complete");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert!(snap.active_batch_id.is_none());

    let item_a = &snap.items[0];
    assert_eq!(item_a.state, ItemState::Success);
    let messages: Vec<&str> = item_a.logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["queued", "worker picked up", "transcribed"]);

    let item_b = &snap.items[1];
    assert_eq!(item_b.state, ItemState::Error);
    assert_eq!(item_b.est_ms, 7000);
    assert_eq!(item_b.logs[0].level, LogLevel::Error);

    wait_closed(&tx).await;
}

#[tokio::test]
async fn shutdown_completion_is_tagged_for_the_host() {
    let (api, tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    handle
        .add_item(ItemDraft::new("Week 5", "transcribe"))
        .await
        .expect("add");
    engine
        .set_on_completion(OnCompletion::Shutdown)
        .await
        .expect("on completion");

    let mut sub = engine.subscribe();
    engine.run(RunOptions::default()).await.expect("run");
    tx.send(Ok(r#"{"batchState":"completed"}"#.to_string()))
        .expect("send");

    match next_matching(&mut sub, |e| matches!(e, CartEvent::ShutdownRequested { .. })).await {
        CartEvent::ShutdownRequested { batch_id } => assert_eq!(batch_id.as_str(), "b-100"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn rejected_enqueue_is_a_transport_error_and_changes_nothing() {
    let (api, _tx) = FakeApi::with_stream();
    api.reject_enqueue.store(true, Ordering::SeqCst);
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    handle
        .add_item(ItemDraft::new("Week 6", "transcribe"))
        .await
        .expect("add");

    let err = engine.run(RunOptions::default()).await.expect_err("rejected");
    match &err {
        CartError::Transport { action, source } => {
            assert_eq!(*action, "start the batch");
            assert!(matches!(source, ApiError::Rejected(reason) if reason == "quota exceeded"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.notice().title, "Could not start the batch");

    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert!(snap.active_batch_id.is_none());
}

#[tokio::test]
async fn controls_require_an_active_batch() {
    let (api, _tx) = FakeApi::with_stream();
    let (engine, _handle) = engine_with(Some(Arc::clone(&api)));

    assert!(matches!(engine.pause().await, Err(CartError::Precondition(_))));
    assert!(matches!(engine.resume().await, Err(CartError::Precondition(_))));
    assert!(matches!(engine.cancel().await, Err(CartError::Precondition(_))));
    assert_eq!(api.calls(), 0);
}

#[tokio::test]
async fn pause_resume_cancel_drive_running_and_active_batch() {
    let (api, tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    handle
        .add_item(ItemDraft::new("Week 7", "transcribe"))
        .await
        .expect("add");
    engine.run(RunOptions::default()).await.expect("run");
    let batch_id = BatchId::from("b-100");

    engine.pause().await.expect("pause");
    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert_eq!(snap.active_batch_id.as_ref(), Some(&batch_id));

    engine.resume().await.expect("resume");
    assert!(handle.snapshot().await.expect("snapshot").running);

    api.fail_control.store(true, Ordering::SeqCst);
    let err = engine.cancel().await.expect_err("control failure");
    assert!(matches!(err, CartError::Transport { action: "cancel the batch", .. }));
    let snap = handle.snapshot().await.expect("snapshot");
    assert!(snap.running);
    assert_eq!(snap.active_batch_id.as_ref(), Some(&batch_id));

    api.fail_control.store(false, Ordering::SeqCst);
    engine.cancel().await.expect("cancel");
    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert!(snap.active_batch_id.is_none());

    let commands: Vec<BatchCommand> = api
        .controls
        .lock()
        .expect("lock")
        .iter()
        .map(|(_, c)| *c)
        .collect();
    assert_eq!(
        commands,
        vec![BatchCommand::Pause, BatchCommand::Resume, BatchCommand::Cancel]
    );
    wait_closed(&tx).await;
}

#[tokio::test]
async fn reorder_is_local_first_and_forwarded_best_effort() {
    let (api, _tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    let a = handle
        .add_item(ItemDraft::new("A", "transcribe"))
        .await
        .expect("add");
    let b = handle
        .add_item(ItemDraft::new("B", "transcribe"))
        .await
        .expect("add");

    let order = engine.reorder(vec![b, a]).await.expect("reorder");
    assert_eq!(order, vec![b, a]);
    assert!(api.reorders.lock().expect("lock").is_empty());

    engine.run(RunOptions::default()).await.expect("run");
    api.fail_reorder.store(true, Ordering::SeqCst);

    let forwarded = api.reordered.notified();
    let order = engine.reorder(vec![a, b]).await.expect("reorder");
    tokio::time::timeout(Duration::from_secs(5), forwarded)
        .await
        .expect("reorder forwarded");

    assert_eq!(order, vec![a, b]);
    let reorders = api.reorders.lock().expect("lock").clone();
    assert_eq!(reorders, vec![(BatchId::from("b-100"), vec![a, b])]);
    let snap = handle.snapshot().await.expect("snapshot");
    let ids: Vec<ItemId> = snap.items.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![a, b]);
}

#[tokio::test]
async fn pending_flag_is_visible_while_run_is_in_flight() {
    let gate = Arc::new(Notify::new());
    let (tx, rx) = mpsc::unbounded_channel::<Result<String, ApiError>>();
    let api = Arc::new(FakeApi {
        stream: Mutex::new(Some(rx)),
        enqueue_gate: Some(Arc::clone(&gate)),
        ..FakeApi::default()
    });
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    handle
        .add_item(ItemDraft::new("Week 8", "transcribe"))
        .await
        .expect("add");
    let engine = Arc::new(engine);

    assert!(engine.pending().is_idle());
    let task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(RunOptions::default()).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.pending().contains(EngineCommand::Run) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("run flagged");
    assert!(!engine.pending().contains(EngineCommand::DryRun));

    gate.notify_one();
    task.await.expect("join").expect("run");
    assert!(engine.pending().is_idle());

    engine.dispose().await;
    wait_closed(&tx).await;
}

#[tokio::test]
async fn clearing_the_active_batch_closes_the_stream() {
    let (api, tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    handle
        .add_item(ItemDraft::new("Week 9", "transcribe"))
        .await
        .expect("add");
    engine.run(RunOptions::default()).await.expect("run");

    tokio::time::timeout(Duration::from_secs(5), async {
        while api.stream.lock().expect("lock").is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream opened");

    handle.set_active_batch(None).await.expect("clear");
    wait_closed(&tx).await;
}

#[tokio::test]
async fn resume_active_batch_reattaches_to_remote_and_drops_local() {
    let (api, tx) = FakeApi::with_stream();
    let state = PersistedState {
        active_batch_id: Some(BatchId::from("b-55")),
        ..PersistedState::default()
    };
    let handle = spawn_cart(
        CartStore::from_state(state),
        None,
        RuntimeConfig::default(),
    );
    let engine = CartEngine::new(
        handle.clone(),
        Some(Arc::clone(&api) as Arc<dyn BatchApi>),
        EngineConfig::default(),
    );

    let resumed = engine.resume_active_batch().await.expect("resume");
    assert_eq!(resumed, Some(BatchId::from("b-55")));
    assert!(handle.snapshot().await.expect("snapshot").running);

    engine.dispose().await;
    wait_closed(&tx).await;
    assert_eq!(api.log_fetches.load(Ordering::SeqCst), 1);

    let state = PersistedState {
        active_batch_id: Some(BatchId::local()),
        ..PersistedState::default()
    };
    let handle = spawn_cart(
        CartStore::from_state(state),
        None,
        RuntimeConfig::default(),
    );
    let engine = CartEngine::new(handle.clone(), None, EngineConfig::default());
    assert_eq!(engine.resume_active_batch().await.expect("resume"), None);
    assert!(
        handle
            .snapshot()
            .await
            .expect("snapshot")
            .active_batch_id
            .is_none()
    );
}

#[tokio::test]
async fn load_preset_detaches_from_the_running_batch() {
    let (api, tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    handle
        .add_item(ItemDraft::new("Week 10", "transcribe"))
        .await
        .expect("add");
    let preset = engine.save_preset("tenth week").await.expect("preset");
    assert!(matches!(
        engine.save_preset("   ").await,
        Err(CartError::Validation(_))
    ));

    engine.run(RunOptions::default()).await.expect("run");
    engine.load_preset(preset.id).await.expect("load");

    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert!(snap.active_batch_id.is_none());
    assert_eq!(snap.items.len(), 1);
    assert_eq!(snap.items[0].state, ItemState::Idle);
    wait_closed(&tx).await;

    assert!(matches!(
        engine.load_preset(ItemId::new_v4()).await,
        Err(CartError::Validation(_))
    ));
}

async fn wait_stream_opened(api: &FakeApi) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while api.stream.lock().expect("lock").is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream opened");
}

async fn wait_follower_gone(engine: &CartEngine) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.is_following().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("follower still attached");
}

fn install_stream(api: &FakeApi) -> Payloads {
    let (tx, rx) = mpsc::unbounded_channel();
    *api.stream.lock().expect("lock") = Some(rx);
    tx
}

#[tokio::test]
async fn dropped_stream_can_be_reattached_or_replaced() {
    let (api, tx) = FakeApi::with_stream();
    let (engine, handle) = engine_with(Some(Arc::clone(&api)));
    let mut sub = engine.subscribe();
    handle
        .add_item(ItemDraft::new("Week 11", "transcribe"))
        .await
        .expect("add");
    let batch_id = BatchId::from("b-100");

    engine.run(RunOptions::default()).await.expect("run");
    wait_stream_opened(&api).await;
    assert!(engine.is_following().await);
    assert!(matches!(
        engine.run(RunOptions::default()).await,
        Err(CartError::Precondition(msg)) if msg == "a batch is already running"
    ));

    // Transport closes without a completion event.
    drop(tx);
    wait_follower_gone(&engine).await;
    let snap = handle.snapshot().await.expect("snapshot");
    assert!(snap.running);
    assert_eq!(snap.active_batch_id.as_ref(), Some(&batch_id));

    let tx = install_stream(&api);
    assert_eq!(
        engine.resume_active_batch().await.expect("resume"),
        Some(batch_id.clone())
    );
    wait_stream_opened(&api).await;
    assert_eq!(api.log_fetches.load(Ordering::SeqCst), 2);
    assert!(engine.is_following().await);

    drop(tx);
    wait_follower_gone(&engine).await;
    let tx = install_stream(&api);
    assert_eq!(
        engine.run(RunOptions::default()).await.expect("fresh run"),
        RunOutcome::Started {
            batch_id: batch_id.clone()
        }
    );
    wait_stream_opened(&api).await;
    assert_eq!(api.log_fetches.load(Ordering::SeqCst), 3);
    assert_eq!(api.enqueued.lock().expect("lock").len(), 2);

    tx.send(Ok(event_json(&BatchEvent {
        batch_state: Some(BatchEvent::COMPLETED.to_string()),
        ..BatchEvent::default()
    })))
    .expect("send");
    next_matching(&mut sub, |e| matches!(e, CartEvent::BatchCompleted { .. })).await;
    let snap = handle.snapshot().await.expect("snapshot");
    assert!(!snap.running);
    assert!(snap.active_batch_id.is_none());
}
