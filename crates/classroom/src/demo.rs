//! Offline-first walkthrough against an in-memory remote.

use std::sync::Arc;

use chrono::{Duration, Utc};
use miette::Result;
use tracing::info;

use classroom_sync::{
    Assignment, ClassId, ClassroomSync, Collection, EntityKind, MemoryRemote, MemoryStore,
    RemoteError, StaticIdentity, Subject, SyncConfig, SyncError, to_fields,
};

fn fail(e: SyncError) -> miette::Report {
    miette::miette!("{}", e)
}

fn show(label: &str, subjects: &Collection<Subject>) {
    let view = subjects.view();
    let names: Vec<String> = view
        .items
        .iter()
        .map(|entity| {
            if entity.is_local_only() {
                format!("{} (local)", entity.data.name)
            } else {
                entity.data.name.clone()
            }
        })
        .collect();
    println!(
        "{:<28} [{}]  synced={} loading={}",
        label,
        names.join(", "),
        view.synced_with_cloud,
        view.loading
    );
}

fn seed(remote: &MemoryRemote, class_id: &ClassId, name: &str, minutes_ago: i64) -> Result<()> {
    let fields = to_fields(&Subject::named(name)).map_err(|e| miette::miette!("{}", e))?;
    remote.insert_doc(
        class_id,
        &Subject::entity_type(),
        fields,
        Utc::now() - Duration::minutes(minutes_ago),
    );
    Ok(())
}

pub async fn run(config: &SyncConfig) -> Result<()> {
    let remote = Arc::new(MemoryRemote::new());
    let class_a = ClassId::from("class-a");
    let class_b = ClassId::from("class-b");
    seed(&remote, &class_a, "Math", 30)?;
    seed(&remote, &class_a, "Science", 20)?;
    seed(&remote, &class_b, "Art", 10)?;

    let sync = ClassroomSync::builder(remote.clone(), Arc::new(MemoryStore::new()))
        .identity(Arc::new(StaticIdentity::new("demo-teacher")))
        .config(config.clone())
        .build();

    println!("=== class A, online ===");
    sync.set_active_class(class_a.clone());
    let subjects = sync.collection::<Subject>();
    subjects.listen().await.map_err(fail)?;
    show("after listen", &subjects);

    println!("\n=== class A, offline ===");
    remote.fail_with(RemoteError::Unavailable("network down".into()));
    let outcome = subjects
        .add(&Subject::named("History"))
        .await
        .map_err(fail)?;
    println!("add History: id={} synced={}", outcome.id, outcome.synced);
    show("after offline add", &subjects);
    for pending in sync.engine().pending_mutations().await {
        println!(
            "pending: {:?} {} in {} ({})",
            pending.operation, pending.record_id, pending.target_class_id, pending.reason
        );
    }

    println!("\n=== class A, back online ===");
    remote.recover();
    subjects.refresh().await.map_err(fail)?;
    show("after refresh", &subjects);

    println!("\n=== switch to class B ===");
    sync.set_active_class(class_b.clone());
    show("right after switch", &subjects);
    println!(
        "class A listener: {:?}",
        sync.subscriptions().status(&class_a, &Subject::entity_type())
    );
    subjects.ensure_loaded().await.map_err(fail)?;
    show("after load", &subjects);

    let assignments = sync.collection::<Assignment>();
    assignments.ensure_loaded().await.map_err(fail)?;
    let homework = Assignment {
        title: "Sketch a still life".into(),
        description: None,
        subject_id: None,
        due_date: Some(Utc::now() + Duration::days(7)),
        points: Some(10),
    };
    let outcome = assignments.add(&homework).await.map_err(fail)?;
    println!(
        "\nassignment {} synced={}, {} assignment(s) in class B",
        outcome.id,
        outcome.synced,
        assignments.items().len()
    );

    sync.shutdown().await.map_err(fail)?;
    info!(
        creates = remote.create_calls(),
        loads = remote.get_calls(),
        "demo finished"
    );
    Ok(())
}
