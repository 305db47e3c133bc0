use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tally::config::Config;
use tally::detector::{Mutation, MutationFilter, StructuralNotifier};
use tally::notifier::Refresh;
use tally::transcript::Role;
use tally::{Engine, EntityKind, MemoryTranscript};

#[tokio::test]
async fn primary_then_legacy_consumers_receive_deltas() -> Result<(), Box<dyn std::error::Error>> {
    let transcript = MemoryTranscript::new();
    let engine = Engine::new(Arc::new(transcript.clone()), Config::default())?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.register_consumer(EntityKind::RedEnvelope, move |entities| {
        let mut seen = sink.lock().expect("lock");
        for entity in entities {
            seen.push(format!("{}:{}", entity.id, entity.state.status_label()));
        }
        Ok(())
    });
    engine.register_consumer(EntityKind::RedEnvelope, |_| anyhow::bail!("widget detached"));

    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let mut directory: HashMap<String, Arc<dyn Refresh>> = HashMap::new();
    directory.insert(
        "messages_app".to_string(),
        Arc::new(move || -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    assert_eq!(engine.discover_legacy(&directory), 1);

    transcript.push(Role::Other, "[红包|rp-1|小明|8.88]");
    let first = engine.run_pass().await?;
    assert_eq!(first.consumer_failures, 1);
    assert_eq!(first.refreshed, 1);

    transcript.push(Role::Me, "[打开红包|rp-1]");
    engine.run_pass().await?;

    // nothing new: no consumer runs
    let idle = engine.run_pass().await?;
    assert_eq!(idle.delivered + idle.refreshed, 0);

    assert_eq!(
        *seen.lock().expect("lock"),
        vec!["rp-1:sent".to_string(), "rp-1:opened".to_string()]
    );
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn panicking_consumer_does_not_stop_detection() -> Result<(), Box<dyn std::error::Error>> {
    let transcript = MemoryTranscript::new();
    transcript.push(Role::Other, "[查看任务|1|Sweep]");
    let engine = Engine::new(Arc::new(transcript.clone()), Config::default())?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    engine.register_consumer(EntityKind::Task, move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("task list renderer crashed");
        }
        Ok(())
    });
    assert_eq!(engine.stats().consumers, 1);

    let mut reports = engine.subscribe();
    let (notifier, push) = StructuralNotifier::channel(MutationFilter::default());
    let handle = engine.start(Some(Box::new(push))).await?;

    let first = tokio::time::timeout(Duration::from_secs(5), reports.recv()).await??;
    assert_eq!(first.added.len(), 1);
    assert_eq!(first.consumer_failures, 1);

    transcript.push(Role::Other, "[查看任务|2|Mop]");
    for _ in 0..3 {
        assert!(notifier.notify(Mutation::new("#chat")));
    }
    let second = tokio::time::timeout(Duration::from_secs(5), reports.recv()).await??;
    assert_eq!(second.added.len(), 1);
    assert_eq!(second.delivered, 1);
    assert_eq!(second.consumer_failures, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.canonical_state(EntityKind::Task).len(), 2);

    handle.shutdown().await;
    Ok(())
}
