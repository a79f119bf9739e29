// Nightly clippy (0.1.64) considers Drop a side effect, see https://github.com/rust-lang/rust-clippy/issues/9608
#![allow(clippy::unnecessary_lazy_evaluations)]

use std::sync::Arc;
use std::time::Duration;
use std::{env, fs};

use anyhow::Result;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::watcher::{self, Event};
use kube::{Client, CustomResourceExt};
use tracing::*;

use weblogic_operator::domain::Domain;
use weblogic_operator::k8s::client::KubeApi;
use weblogic_operator::kernel::engine::Engine;
use weblogic_operator::pod::model::StandardPodModels;
use weblogic_operator::reconciler::DomainReconciler;
use weblogic_operator::snapshot::{DomainSnapshot, SpecDerivedTopology};
use weblogic_operator::tuning::Tuning;

const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_default();
    if cmd == "export" {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&Domain::crd())?);
        Ok(())
    } else if cmd == "run" {
        let tuning = load_tuning()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(tuning.worker_count())
            .enable_all()
            .build()?;
        runtime.block_on(run(tuning))
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
        Ok(())
    }
}

/// Tuning comes from the file named by TUNING_FILE, defaulting otherwise.
fn load_tuning() -> Result<Tuning> {
    match env::var("TUNING_FILE") {
        Ok(path) => {
            let raw = fs::read_to_string(&path)?;
            let tuning = serde_yaml::from_str(&raw)?;
            info!(path = %path, "loaded tuning");
            Ok(tuning)
        }
        Err(_) => Ok(Tuning::default()),
    }
}

async fn run(tuning: Tuning) -> Result<()> {
    info!("running weblogic-operator");
    let client = Client::try_default().await?;
    let tuning = Arc::new(tuning);
    let engine = Engine::new(tuning.worker_count());
    let api = Arc::new(KubeApi::new(client.clone()));
    let operator_cert = env::var("OPERATOR_INTERNAL_CERT_DATA").ok();

    let reconciler = DomainReconciler::new(
        engine.clone(),
        api,
        Arc::new(SpecDerivedTopology),
        Arc::new(StandardPodModels::new(
            tuning.clone(),
            OPERATOR_VERSION,
            operator_cert,
        )),
        tuning.clone(),
        OPERATOR_VERSION,
        Some(client.clone()),
    );

    // Periodic full relist: resubmits idle domains so a missed watch
    // event can never strand a domain out of spec.
    let relist = {
        let reconciler = reconciler.clone();
        let domains = Api::<Domain>::all(client.clone());
        engine.schedule_at_fixed_rate(tuning.relist_interval(), tuning.relist_interval(), move || {
            let reconciler = reconciler.clone();
            let domains = domains.clone();
            async move {
                match domains.list(&ListParams::default()).await {
                    Ok(list) => {
                        for domain in list {
                            submit_domain(&reconciler, &domain, false);
                        }
                    }
                    Err(e) => warn!(error = %e, "domain relist failed"),
                }
            }
        })
    };

    let watch = {
        let reconciler = reconciler.clone();
        let domains = Api::<Domain>::all(client.clone());
        async move {
            let mut stream = watcher::watcher(domains, ListParams::default()).boxed();
            loop {
                match stream.next().await {
                    Some(Ok(Event::Applied(domain))) => {
                        submit_domain(&reconciler, &domain, true);
                    }
                    Some(Ok(Event::Deleted(domain))) => {
                        if let Ok(snapshot) = DomainSnapshot::from_domain(&domain) {
                            info!(domain = %snapshot.domain_uid, "domain deleted, cancelling its fiber");
                            reconciler.cancel_domain(&snapshot.namespace, &snapshot.domain_uid);
                        }
                    }
                    Some(Ok(Event::Restarted(list))) => {
                        for domain in list {
                            submit_domain(&reconciler, &domain, false);
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "domain watch error, stream will resync"),
                    None => break,
                }
            }
        }
    };

    tokio::select! {
        _ = watch => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    relist.abort();
    reconciler.shutdown(Duration::from_secs(30)).await;
    info!("operator terminated");
    Ok(())
}

fn submit_domain(reconciler: &DomainReconciler, domain: &Domain, preempt: bool) {
    match DomainSnapshot::from_domain(domain) {
        Ok(snapshot) => {
            debug!(domain = %snapshot.domain_uid, generation = snapshot.generation, "submitting domain");
            if preempt {
                let _ = reconciler.submit(snapshot);
            } else {
                let _ = reconciler.submit_if_idle(snapshot);
            }
        }
        Err(e) => warn!(error = %e, "ignoring malformed domain resource"),
    }
}
