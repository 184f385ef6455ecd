use std::sync::Arc;

use sales_funnel::campaign::{
    BatchDispatcher, CampaignQueue, CampaignRecords, MessageSender, PacedSender,
};
use sales_funnel::channels::{ConsoleInput, ConsoleSender, WhatsAppCloudSender, console};
use sales_funnel::config::{CampaignConfig, FunnelConfig, WhatsAppConfig};
use sales_funnel::conversation::InboundProcessor;
use sales_funnel::conversation::notify::{LogSink, Notifier, WhatsAppAdminSink};
use sales_funnel::llm::{LlmConfig, LlmLanguageAdapter, create_provider};
use sales_funnel::store::{Database, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LLM_API_KEY=...");
        std::process::exit(1);
    });
    let funnel_config = FunnelConfig::from_env()?;
    let campaign_config = CampaignConfig::from_env()?;
    let whatsapp_config = WhatsAppConfig::from_env();

    eprintln!("📈 Sales Funnel v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!(
        "   Stages: ceiling {}, close threshold {}",
        funnel_config.stage_table.ceiling(),
        funnel_config.stage_table.close_threshold()
    );
    eprintln!(
        "   Campaigns: max {} concurrent",
        campaign_config.max_concurrent_campaigns
    );

    // ── Outbound channel ─────────────────────────────────────────────────
    let (raw_sender, admin_numbers, min_interval, send_timeout) = match whatsapp_config {
        Some(ref wa) => {
            eprintln!("   Channel: WhatsApp Cloud ({})", wa.phone_number_id);
            let sender: Arc<dyn MessageSender> = Arc::new(WhatsAppCloudSender::new(wa)?);
            (
                sender,
                wa.admin_numbers.clone(),
                wa.min_send_interval,
                wa.send_timeout,
            )
        }
        None => {
            eprintln!("   Channel: console (WHATSAPP_ACCESS_TOKEN not set)");
            let sender: Arc<dyn MessageSender> = Arc::new(ConsoleSender::new());
            (
                sender,
                Vec::new(),
                std::time::Duration::ZERO,
                std::time::Duration::from_secs(30),
            )
        }
    };
    let sender: Arc<dyn MessageSender> =
        Arc::new(PacedSender::new(raw_sender, min_interval, send_timeout));

    // ── Store + inbound pipeline ─────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let llm = create_provider(&llm_config)?;
    let adapter = Arc::new(LlmLanguageAdapter::new(
        llm,
        funnel_config.stage_table.clone(),
    ));

    let mut notifier = Notifier::new().with_sink(Arc::new(LogSink));
    if !admin_numbers.is_empty() {
        eprintln!("   Admin notifications: {} number(s)", admin_numbers.len());
        notifier = notifier.with_sink(Arc::new(WhatsAppAdminSink::new(
            Arc::clone(&sender),
            admin_numbers,
        )));
    }

    let processor = Arc::new(
        InboundProcessor::new(Arc::clone(&db), adapter, Arc::clone(&sender), funnel_config)
            .with_notifier(notifier),
    );

    // ── Campaign engine ──────────────────────────────────────────────────
    let records = Arc::new(CampaignRecords::new(Arc::clone(&db)));
    let dispatcher = Arc::new(BatchDispatcher::new(
        Arc::clone(&records),
        Arc::clone(&sender),
        campaign_config.clone(),
    ));
    let queue = CampaignQueue::new(records, dispatcher, campaign_config);
    queue.start_background();

    eprintln!("   Input: JSON inbound events or /commands on stdin\n");

    let mut input = console::spawn_stdin_reader();
    loop {
        tokio::select! {
            line = input.recv() => {
                let Some(line) = line else { break };
                handle_input(line, &processor, &queue).await;
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n   Shutting down");
                break;
            }
        }
    }

    queue.stop_background();
    Ok(())
}

async fn handle_input(
    input: ConsoleInput,
    processor: &Arc<InboundProcessor>,
    queue: &Arc<CampaignQueue>,
) {
    let result = match input {
        ConsoleInput::Event(event) => {
            let processor = Arc::clone(processor);
            tokio::spawn(async move {
                let identity = event.identity.clone();
                match processor.handle(event).await {
                    Ok(outcome) => tracing::debug!(identity = %identity, outcome = ?outcome, "Event handled"),
                    Err(e) => tracing::warn!(identity = %identity, error = %e, "Event failed"),
                }
            });
            Ok(())
        }
        ConsoleInput::CreateCampaign(campaign) => queue
            .create(*campaign)
            .await
            .map(|id| eprintln!("   Campaign {id} created")),
        ConsoleInput::Start(id) => queue.start(id).await,
        ConsoleInput::Pause(id) => queue.pause(id).await,
        ConsoleInput::Resume(id) => queue.resume(id).await,
        ConsoleInput::Cancel(id) => queue.cancel(id).await,
        ConsoleInput::Status => {
            let snapshot = queue.snapshot().await;
            eprintln!(
                "   Pending: {:?}\n   Running: {:?}",
                snapshot.pending, snapshot.running
            );
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("   Error: {e}");
    }
}
