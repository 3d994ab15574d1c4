// src/commands.rs

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{CommandKind, Settings, WriteTo};
use crate::fetch::census_url;
use crate::log::{
    group_for_topic, KafkaLog, LogClient, MemoryLog, RetryPolicy, TopicSpec, COMPUTE_TOPIC,
    RESULTS_TOPIC,
};
use crate::process::{
    read_and_chunk, BatchChunker, ChunkReport, Sink, Source, StageOutcome, StageRunner,
    TransformStage,
};
use crate::results::{server, AggregateStage, Aggregator, CodeCatalog};

/// Runs the command named in `settings` until it finishes or `cancel` fires.
pub async fn run(settings: Settings, cancel: CancellationToken) -> Result<()> {
    match settings.command {
        CommandKind::Pipeline => return pipeline(&settings, cancel).await,
        CommandKind::Read if settings.write_to != WriteTo::Kafka => {
            return read(&settings, None).await.map(|_| ())
        }
        _ => {}
    }

    let log = connect(&settings)?;
    let mut out = std::io::stdout();
    match settings.command {
        CommandKind::Read => read(&settings, Some(log)).await.map(|_| ()),
        CommandKind::Compute => compute(&settings, log, cancel).await,
        CommandKind::Results => results(&settings, log, cancel).await,
        CommandKind::Topiclist => topiclist(log.as_ref(), &mut out).await,
        CommandKind::Offsets => offsets(log.as_ref(), &settings.topics, &mut out).await,
        CommandKind::Rmtopics => rmtopics(log.as_ref(), &settings.topics, &mut out).await,
        CommandKind::Pipeline => pipeline(&settings, cancel).await,
    }
}

fn connect(settings: &Settings) -> Result<Arc<dyn LogClient>> {
    let brokers = settings
        .brokers
        .as_deref()
        .context("no Kafka brokers configured")?;
    let log = KafkaLog::connect(brokers)
        .with_context(|| format!("connecting to Kafka at {}", brokers))?;
    info!(brokers, "connected to Kafka");
    Ok(Arc::new(log))
}

fn topic_spec(settings: &Settings, name: &str) -> TopicSpec {
    TopicSpec::new(name, settings.partitions, settings.replication)
}

/// Sink for a producing stage. Writing to the log creates `topic` first.
async fn output_sink(
    settings: &Settings,
    log: Option<Arc<dyn LogClient>>,
    topic: &str,
    label: &'static str,
) -> Result<Sink> {
    match (settings.write_to, log) {
        (WriteTo::Kafka, Some(log)) => {
            let created = log
                .create_topic_if_absent(&topic_spec(settings, topic))
                .await
                .with_context(|| format!("creating topic {}", topic))?;
            if created {
                info!(topic, partitions = settings.partitions, "created topic");
            }
            Ok(Sink::log(log, topic, RetryPolicy::default()))
        }
        (WriteTo::Kafka, None) => Err(anyhow!("writing to {} needs a log connection", topic)),
        (WriteTo::Stdout, _) => Ok(Sink::Stdout { label }),
        (WriteTo::Discard, _) => Ok(Sink::Discard),
    }
}

/// The record streams a `read` run walks: the one `--from-file` source, or
/// every year × month on the census site.
pub fn sources(settings: &Settings) -> Result<Vec<Source>> {
    if let Some(locator) = &settings.from_file {
        let year = *settings
            .years
            .first()
            .context("--from-file needs the year of the file")?;
        return Ok(vec![Source {
            year,
            locator: locator.clone(),
        }]);
    }
    let mut out = Vec::with_capacity(settings.years.len() * settings.months.len());
    for &year in &settings.years {
        for &month in &settings.months {
            let url = census_url(year, month)
                .with_context(|| format!("building census URL for {} {}", month, year))?;
            out.push(Source {
                year,
                locator: crate::fetch::SourceLocator::Url(url),
            });
        }
    }
    Ok(out)
}

#[instrument(level = "info", skip_all)]
pub async fn read(settings: &Settings, log: Option<Arc<dyn LogClient>>) -> Result<ChunkReport> {
    let sink = output_sink(settings, log, COMPUTE_TOPIC, "chunk").await?;
    let sources = sources(settings)?;
    let mut chunker = BatchChunker::new(sink, settings.ceiling, settings.delay);
    let report = read_and_chunk(&Client::new(), &sources, &mut chunker, RetryPolicy::default())
        .await
        .context("chunking sources")?;

    for (source, reason) in &report.failed {
        warn!(source = %source, reason = %reason, "source skipped");
    }
    info!(
        batches = report.batches,
        sources_read = report.sources_read,
        sources_failed = report.failed.len(),
        ceiling_reached = report.ceiling_reached,
        "read finished"
    );
    Ok(report)
}

fn stage_result(stage: &str, outcome: StageOutcome) -> Result<()> {
    match outcome {
        StageOutcome::Eof | StageOutcome::Cancelled => Ok(()),
        StageOutcome::Failed(e) => Err(anyhow!(e).context(format!("{} stage failed", stage))),
    }
}

#[instrument(level = "info", skip_all)]
pub async fn compute(
    settings: &Settings,
    log: Arc<dyn LogClient>,
    cancel: CancellationToken,
) -> Result<()> {
    log.create_topic_if_absent(&topic_spec(settings, COMPUTE_TOPIC))
        .await
        .context("creating compute topic")?;
    let sink = output_sink(settings, Some(log.clone()), RESULTS_TOPIC, "codes").await?;
    let mut consumer = log
        .subscribe(COMPUTE_TOPIC, &group_for_topic(COMPUTE_TOPIC))
        .await
        .context("subscribing to compute topic")?;

    let runner = StageRunner::new("compute", RetryPolicy::default(), cancel);
    let mut stage = TransformStage::new(sink, settings.delay);
    stage_result("compute", runner.run(consumer.as_mut(), &mut stage).await)
}

fn housing_aggregator() -> Arc<Aggregator> {
    Arc::new(Aggregator::new(Arc::new(CodeCatalog::housing_unit_types())))
}

fn listen_addr(settings: &Settings) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], settings.port))
}

#[instrument(level = "info", skip_all)]
pub async fn results(
    settings: &Settings,
    log: Arc<dyn LogClient>,
    cancel: CancellationToken,
) -> Result<()> {
    let agg = housing_aggregator();
    let (_, server) = server::bind(agg.clone(), listen_addr(settings), cancel.clone())?;
    let server = tokio::spawn(server);

    log.create_topic_if_absent(&topic_spec(settings, RESULTS_TOPIC))
        .await
        .context("creating results topic")?;
    let mut consumer = log
        .subscribe(RESULTS_TOPIC, &group_for_topic(RESULTS_TOPIC))
        .await
        .context("subscribing to results topic")?;

    let runner = StageRunner::new("results", RetryPolicy::default(), cancel.clone());
    let mut stage = AggregateStage::new(agg.clone(), settings.delay);
    let outcome = runner.run(consumer.as_mut(), &mut stage).await;
    if outcome != StageOutcome::Cancelled {
        info!(total = agg.total(), "aggregation stopped; serving results until interrupted");
        cancel.cancelled().await;
    }
    server.await.context("results server task")?;
    stage_result("results", outcome)
}

/// Prints every partition with its leader.
pub async fn topiclist<W: Write>(log: &dyn LogClient, out: &mut W) -> Result<()> {
    let partitions = log.list_topics().await.context("listing topics")?;
    writeln!(out, "{:<70}{:<15}{:<20}", "Topic", "Partition ID", "Leader")?;
    for p in partitions {
        writeln!(out, "{:<70}{:<15}{:<20}", p.topic, p.partition, p.leader)?;
    }
    Ok(())
}

/// Prints first, last and committed offsets per partition of each topic.
pub async fn offsets<W: Write>(log: &dyn LogClient, topics: &[String], out: &mut W) -> Result<()> {
    for topic in topics {
        let group = group_for_topic(topic);
        let offsets = log
            .list_offsets(topic, &group)
            .await
            .with_context(|| format!("listing offsets for {}", topic))?;
        writeln!(out, "Topic: {} (group {})", topic, group)?;
        writeln!(
            out,
            "{:<20}{:<20}{:<20}{:<20}",
            "Partition", "FirstOffset", "LastOffset", "Committed"
        )?;
        for o in offsets {
            let committed = o
                .committed
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "{:<20}{:<20}{:<20}{:<20}",
                o.partition, o.first, o.last, committed
            )?;
        }
    }
    Ok(())
}

/// Deletes each topic and prints the per-topic outcome. Fails if any
/// deletion failed.
pub async fn rmtopics<W: Write>(log: &dyn LogClient, topics: &[String], out: &mut W) -> Result<()> {
    let outcomes = log.delete_topics(topics).await.context("deleting topics")?;
    let mut failed = 0;
    for (topic, outcome) in outcomes {
        match outcome {
            Ok(()) => writeln!(out, "deleted topic: {}", topic)?,
            Err(e) => {
                failed += 1;
                error!(topic = %topic, error = %e, "delete failed");
                writeln!(out, "failed to delete topic {}: {}", topic, e)?;
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{} of {} topics could not be deleted", failed, topics.len()));
    }
    Ok(())
}

/// Runs read, compute and results over `log` until the input is exhausted
/// and both stages have drained their topics.
pub async fn run_pipeline(
    settings: &Settings,
    log: &MemoryLog,
    agg: Arc<Aggregator>,
    cancel: CancellationToken,
) -> Result<ChunkReport> {
    for topic in [COMPUTE_TOPIC, RESULTS_TOPIC] {
        log.create_topic_if_absent(&topic_spec(settings, topic)).await?;
    }
    let client: Arc<dyn LogClient> = Arc::new(log.clone());

    let mut compute_in = log
        .subscribe(COMPUTE_TOPIC, &group_for_topic(COMPUTE_TOPIC))
        .await?;
    let mut results_in = log
        .subscribe(RESULTS_TOPIC, &group_for_topic(RESULTS_TOPIC))
        .await?;

    let compute_runner = StageRunner::new("compute", RetryPolicy::default(), cancel.clone());
    let mut transform = TransformStage::new(
        Sink::log(client.clone(), RESULTS_TOPIC, RetryPolicy::default()),
        settings.delay,
    );
    let results_log = log.clone();
    let compute = tokio::spawn(async move {
        let outcome = compute_runner.run(compute_in.as_mut(), &mut transform).await;
        // nothing else writes results
        if let Err(e) = results_log.close_topic(RESULTS_TOPIC) {
            warn!(error = %e, "closing results topic");
        }
        outcome
    });

    let results_runner = StageRunner::new("results", RetryPolicy::default(), cancel);
    let mut aggregate = AggregateStage::new(agg, settings.delay);
    let results = tokio::spawn(async move {
        results_runner
            .run(results_in.as_mut(), &mut aggregate)
            .await
    });

    let sink = Sink::log(client, COMPUTE_TOPIC, RetryPolicy::default());
    let mut chunker = BatchChunker::new(sink, settings.ceiling, settings.delay);
    let read = read_and_chunk(
        &Client::new(),
        &sources(settings)?,
        &mut chunker,
        RetryPolicy::default(),
    )
    .await;
    log.close_topic(COMPUTE_TOPIC)?;

    let compute_outcome = compute.await.context("compute stage task")?;
    let results_outcome = results.await.context("results stage task")?;
    let report = read.context("chunking sources")?;
    stage_result("compute", compute_outcome)?;
    stage_result("results", results_outcome)?;
    Ok(report)
}

/// Single-process run over an in-memory log, serving results until
/// interrupted.
#[instrument(level = "info", skip_all)]
pub async fn pipeline(settings: &Settings, cancel: CancellationToken) -> Result<()> {
    let agg = housing_aggregator();
    let (_, server) = server::bind(agg.clone(), listen_addr(settings), cancel.clone())?;
    let server = tokio::spawn(server);

    let log = MemoryLog::new();
    let outcome = run_pipeline(settings, &log, agg.clone(), cancel.clone()).await;
    match &outcome {
        Ok(report) => info!(
            batches = report.batches,
            results = log.len(RESULTS_TOPIC),
            counted = agg.total(),
            "pipeline drained; serving results until interrupted"
        ),
        Err(e) => error!(error = %e, "pipeline failed; serving partial results until interrupted"),
    }
    cancel.cancelled().await;
    server.await.context("results server task")?;
    outcome.map(|_| ())
}
