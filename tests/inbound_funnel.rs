//! Integration tests for the inbound path: gate, stage engine, field
//! merging and admin notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use sales_funnel::campaign::{MessageSender, SendReceipt};
use sales_funnel::config::{DEFAULT_FALLBACK_MESSAGE, FunnelConfig};
use sales_funnel::conversation::classifier::InputClass;
use sales_funnel::conversation::notify::{
    NotificationEvent, NotificationKind, NotificationSink, Notifier,
};
use sales_funnel::conversation::{
    Conversation, ConversationStatus, InboundEvent, InboundProcessor, InterestLevel,
    ProcessOutcome, ProposalGenerator, Stage,
};
use sales_funnel::error::{ChannelError, LlmError};
use sales_funnel::llm::adapter::{AdapterDecision, AdapterRequest, LanguageAdapter};
use sales_funnel::store::{Database, MemoryStore};

const LEAD: &str = "5581988887777";

type Script = Box<dyn Fn(&AdapterRequest) -> Result<AdapterDecision, LlmError> + Send + Sync>;

/// Language adapter driven by a closure, with an optional think time.
struct FunnelAdapter {
    script: Script,
    think_time: Duration,
    calls: AtomicUsize,
}

impl FunnelAdapter {
    fn new(
        script: impl Fn(&AdapterRequest) -> Result<AdapterDecision, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            think_time: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(
        think_time: Duration,
        script: impl Fn(&AdapterRequest) -> Result<AdapterDecision, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            think_time,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageAdapter for FunnelAdapter {
    async fn decide(&self, request: &AdapterRequest) -> Result<AdapterDecision, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.think_time.is_zero() {
            tokio::time::sleep(self.think_time).await;
        }
        (self.script)(request)
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSender {
    async fn texts(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, identity: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let mut sent = self.sent.lock().await;
        sent.push((identity.to_string(), text.to_string()));
        Ok(SendReceipt {
            provider_message_id: format!("wamid.{}", sent.len()),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    async fn count(&self, kind: NotificationKind) -> usize {
        self.events.lock().await.iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct Funnel {
    store: Arc<MemoryStore>,
    sender: Arc<RecordingSender>,
    processor: Arc<InboundProcessor>,
}

fn funnel(adapter: Arc<FunnelAdapter>, config: FunnelConfig, notifier: Notifier) -> Funnel {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::default());
    let processor = InboundProcessor::new(store.clone(), adapter, sender.clone(), config)
        .with_notifier(notifier);
    Funnel {
        store,
        sender,
        processor: Arc::new(processor),
    }
}

/// Let spawned notification deliveries run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn advance_one(request: &AdapterRequest) -> Result<AdapterDecision, LlmError> {
    Ok(AdapterDecision::new(
        request.stage.index() as i64 + 1,
        &["Certo!"],
    ))
}

#[tokio::test(start_paused = true)]
async fn concurrent_events_for_one_lead_are_single_flight() {
    let adapter = FunnelAdapter::slow(Duration::from_secs(1), advance_one);
    let f = funnel(adapter.clone(), FunnelConfig::default(), Notifier::new());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let processor = Arc::clone(&f.processor);
            tokio::spawn(async move {
                processor
                    .handle(InboundEvent::text(LEAD, format!("mensagem {i}")))
                    .await
            })
        })
        .collect();

    let mut processed = 0;
    let mut dropped = 0;
    for handle in futures::future::join_all(handles).await {
        match handle.unwrap().unwrap() {
            ProcessOutcome::Processed { .. } => processed += 1,
            ProcessOutcome::Dropped => dropped += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(dropped, 15);
    assert_eq!(adapter.calls(), 1);
    assert!(!f.processor.gate().is_in_flight(LEAD));

    let conv = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(conv.stage, Stage::Discovery);
    // One customer turn and one agent turn
    assert_eq!(conv.history.len(), 2);
}

#[tokio::test]
async fn price_question_fast_tracks_to_data_collection() {
    let adapter = FunnelAdapter::new(|request| {
        if request.classified.class == InputClass::PriceInquiry {
            Ok(AdapterDecision::new(4, &["Para calcular, preciso de alguns dados."]))
        } else {
            advance_one(request)
        }
    });
    let f = funnel(adapter, FunnelConfig::default(), Notifier::new());

    let mut conv = Conversation::new(LEAD);
    conv.stage = Stage::Qualification;
    f.store.save_conversation(&conv).await.unwrap();

    let outcome = f
        .processor
        .handle(InboundEvent::text(LEAD, "Quanto custa a instalação?"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            stage: Stage::DataCollection,
            adapter_failed: false,
            messages_sent: 1,
        }
    );

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::DataCollection);
}

#[tokio::test]
async fn reaching_the_ceiling_closes_the_conversation() {
    let adapter = FunnelAdapter::new(|_| Ok(AdapterDecision::new(99, &["Fechado, obrigado!"])));
    let f = funnel(adapter.clone(), FunnelConfig::default(), Notifier::new());

    let mut conv = Conversation::new(LEAD);
    conv.stage = Stage::Negotiation;
    f.store.save_conversation(&conv).await.unwrap();

    let first = f
        .processor
        .handle(InboundEvent::text(LEAD, "pode fechar"))
        .await
        .unwrap();
    assert!(matches!(
        first,
        ProcessOutcome::Processed {
            stage: Stage::Closed,
            ..
        }
    ));

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Closed);
    assert_eq!(stored.status, ConversationStatus::Completed);

    let second = f
        .processor
        .handle(InboundEvent::text(LEAD, "mais uma coisa"))
        .await
        .unwrap();
    assert_eq!(second, ProcessOutcome::Closed);
    assert_eq!(adapter.calls(), 1, "closed conversations never reach the adapter");
    assert_eq!(f.sender.texts().await, vec!["Fechado, obrigado!".to_string()]);
}

#[tokio::test]
async fn adapter_failure_sends_fallback_and_holds_stage() {
    let adapter = FunnelAdapter::new(|_| {
        Err(LlmError::RequestFailed {
            provider: "test".into(),
            reason: "upstream 503".into(),
        })
    });
    let f = funnel(adapter, FunnelConfig::default(), Notifier::new());

    let mut conv = Conversation::new(LEAD);
    conv.stage = Stage::Education;
    f.store.save_conversation(&conv).await.unwrap();

    let outcome = f
        .processor
        .handle(InboundEvent::text(LEAD, "e a garantia?"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            stage: Stage::Education,
            adapter_failed: true,
            messages_sent: 1,
        }
    );
    assert_eq!(f.sender.texts().await, vec![DEFAULT_FALLBACK_MESSAGE.to_string()]);

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Education);
}

#[tokio::test(start_paused = true)]
async fn slow_adapter_times_out_into_fallback() {
    let adapter = FunnelAdapter::slow(Duration::from_secs(60), advance_one);
    let config = FunnelConfig {
        adapter_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let f = funnel(adapter, config, Notifier::new());

    let outcome = f
        .processor
        .handle(InboundEvent::text(LEAD, "oi, tudo bem?"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            stage: Stage::Greeting,
            adapter_failed: true,
            messages_sent: 1,
        }
    );
    assert_eq!(f.sender.texts().await, vec![DEFAULT_FALLBACK_MESSAGE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn high_interest_notifies_once_per_change() {
    let adapter = FunnelAdapter::new(|request| {
        Ok(AdapterDecision::new(request.stage.index() as i64, &["Ótimo!"])
            .with_interest(InterestLevel::High))
    });
    let sink = Arc::new(RecordingSink::default());
    let notifier = Notifier::new().with_sink(sink.clone());
    let f = funnel(adapter, FunnelConfig::default(), notifier);

    for text in ["quero muito instalar", "sério, quero logo"] {
        f.processor
            .handle(InboundEvent::text(LEAD, text))
            .await
            .unwrap();
        settle().await;
    }

    assert_eq!(sink.count(NotificationKind::NewLead).await, 1);
    assert_eq!(sink.count(NotificationKind::HighInterest).await, 1);
    assert_eq!(sink.count(NotificationKind::QualifiedLead).await, 0);
}

#[tokio::test(start_paused = true)]
async fn crossing_close_threshold_notifies_qualified_lead() {
    let adapter = FunnelAdapter::new(|_| Ok(AdapterDecision::new(7, &["Segue a proposta."])));
    let sink = Arc::new(RecordingSink::default());
    let f = funnel(
        adapter,
        FunnelConfig::default(),
        Notifier::new().with_sink(sink.clone()),
    );

    let mut conv = Conversation::new(LEAD);
    conv.stage = Stage::BillAnalysis;
    f.store.save_conversation(&conv).await.unwrap();

    f.processor
        .handle(InboundEvent::text(LEAD, "pode mandar"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(sink.count(NotificationKind::QualifiedLead).await, 1);
    assert_eq!(sink.count(NotificationKind::NewLead).await, 0);
}

#[tokio::test]
async fn field_updates_merge_without_erasing() {
    let adapter = FunnelAdapter::new(|request| {
        let decision = AdapterDecision::new(request.stage.index() as i64 + 1, &["Anotado."]);
        Ok(match request.stage {
            Stage::Greeting => decision.with_field("name", "Ana").with_field("bill", "R$ 350,00"),
            // Blank values never erase what is already known
            _ => decision.with_field("city", "Recife").with_field("name", ""),
        })
    });
    let f = funnel(adapter, FunnelConfig::default(), Notifier::new());

    f.processor
        .handle(InboundEvent::text(LEAD, "sou a Ana, pago uns 350"))
        .await
        .unwrap();
    f.processor
        .handle(InboundEvent::text(LEAD, "moro em Recife"))
        .await
        .unwrap();

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(stored.known_fields.get("name"), Some("Ana"));
    assert_eq!(stored.known_fields.get("city"), Some("Recife"));
    assert_eq!(
        stored.known_fields.decimal("bill"),
        Some(rust_decimal_macros::dec!(350.00))
    );
    assert_eq!(stored.stage, Stage::Qualification);
}

#[tokio::test]
async fn opt_out_flags_lead_without_calling_adapter() {
    let adapter = FunnelAdapter::new(advance_one);
    let f = funnel(adapter.clone(), FunnelConfig::default(), Notifier::new());

    let outcome = f
        .processor
        .handle(InboundEvent::text(LEAD, "PARAR"))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::OptedOut);
    assert_eq!(adapter.calls(), 0);

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert!(stored.opted_out);
    assert_eq!(f.sender.texts().await.len(), 1);
}

#[tokio::test]
async fn writing_after_opt_out_opts_back_in() {
    let adapter = FunnelAdapter::new(advance_one);
    let f = funnel(adapter.clone(), FunnelConfig::default(), Notifier::new());

    f.processor
        .handle(InboundEvent::text(LEAD, "PARAR"))
        .await
        .unwrap();
    f.processor
        .handle(InboundEvent::text(LEAD, "oi, voltei"))
        .await
        .unwrap();

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert!(!stored.opted_out);
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn bill_question_is_not_an_opt_out() {
    let adapter = FunnelAdapter::new(advance_one);
    let f = funnel(adapter.clone(), FunnelConfig::default(), Notifier::new());

    let outcome = f
        .processor
        .handle(InboundEvent::text(LEAD, "não quero receber a fatura em papel"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Processed { .. }));
    assert_eq!(adapter.calls(), 1);
    assert!(!f.store.load_conversation(LEAD).await.unwrap().unwrap().opted_out);
}

#[tokio::test(start_paused = true)]
async fn slow_reply_bubbles_do_not_fail_a_saved_turn() {
    let adapter = FunnelAdapter::new(|_| {
        let mut decision = AdapterDecision::new(1, &["Oi!", "Tudo bem?", "Me conta mais."]);
        for message in &mut decision.messages {
            message.delay_before_ms = 600_000;
        }
        Ok(decision)
    });
    let config = FunnelConfig {
        processing_timeout: Duration::from_secs(10),
        max_reply_delay: Duration::from_secs(8),
        ..Default::default()
    };
    let f = funnel(adapter, config, Notifier::new());

    let started = tokio::time::Instant::now();
    let outcome = f
        .processor
        .handle(InboundEvent::text(LEAD, "oi"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            stage: Stage::Discovery,
            adapter_failed: false,
            messages_sent: 3,
        }
    );
    // Each pause is capped, and the sends outlast the processing timeout
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(24) && elapsed < Duration::from_secs(25));

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_ne!(stored.status, ConversationStatus::Error);
    assert_eq!(stored.stage, Stage::Discovery);
    assert_eq!(f.sender.texts().await.len(), 3);
}

/// Counts proposal generations.
#[derive(Default)]
struct CountingProposals {
    generated: AtomicUsize,
}

#[async_trait]
impl ProposalGenerator for CountingProposals {
    async fn generate(&self, conversation: &Conversation) -> Result<String, String> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("proposal #{n} for {}", conversation.identity))
    }
}

async fn proposal_funnel(from: Stage) -> (Funnel, Arc<CountingProposals>) {
    let adapter = FunnelAdapter::new(|_| Ok(AdapterDecision::new(7, &["Segue a proposta."])));
    let proposals = Arc::new(CountingProposals::default());
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::default());
    let processor = InboundProcessor::new(store.clone(), adapter, sender.clone(), FunnelConfig::default())
        .with_proposal_generator(proposals.clone());
    let f = Funnel {
        store,
        sender,
        processor: Arc::new(processor),
    };
    let mut conv = Conversation::new(LEAD);
    conv.stage = from;
    f.store.save_conversation(&conv).await.unwrap();
    (f, proposals)
}

#[tokio::test]
async fn returning_to_proposal_regenerates_it() {
    let (f, proposals) = proposal_funnel(Stage::FollowUp).await;

    f.processor
        .handle(InboundEvent::text(LEAD, "pode refazer a proposta com 10 placas?"))
        .await
        .unwrap();

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Proposal);
    assert_eq!(proposals.generated.load(Ordering::SeqCst), 1);
    assert!(stored.pending_context.as_deref().unwrap().contains("proposal #1"));
}

#[tokio::test]
async fn staying_at_proposal_does_not_regenerate() {
    let (f, proposals) = proposal_funnel(Stage::Proposal).await;

    f.processor
        .handle(InboundEvent::text(LEAD, "vou ver com minha esposa"))
        .await
        .unwrap();

    let stored = f.store.load_conversation(LEAD).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Proposal);
    assert_eq!(proposals.generated.load(Ordering::SeqCst), 0);
}
