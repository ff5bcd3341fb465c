use crate::{
    admission::Admission,
    config::Defaults,
    core::{metrics::AllocatorMetrics, Allocator, Policy},
    k8s::PodLister,
    metrics::WebhookMetrics,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(name = "hostport", about = "Assigns host ports to pods as they are admitted")]
pub struct Args {
    #[clap(
        long,
        default_value = "hostport=info,warn",
        env = "HOSTPORT_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The policy used for pods without a `hostport.io/policy` annotation.
    #[clap(long, default_value = "Index")]
    default_policy: Policy,

    #[clap(long, default_value = "7000")]
    default_min_port: u16,

    #[clap(long, default_value = "8000")]
    default_max_port: u16,

    /// The number of host ports reserved for each pod ordinal under the `Index` policy.
    #[clap(long, default_value = "10")]
    default_stride: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            default_policy,
            default_min_port,
            default_max_port,
            default_stride,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let defaults = Defaults {
            policy: default_policy,
            min_port: default_min_port,
            max_port: default_max_port,
            stride: default_stride,
        };
        defaults.range().context("invalid default port range")?;

        let mut prom = <Registry>::default();
        let hostport = prom.sub_registry_with_prefix("hostport");
        let allocator_metrics = AllocatorMetrics::register(hostport);
        let webhook_metrics = WebhookMetrics::register(hostport);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let allocator = Arc::new(Allocator::new(
            PodLister::new(runtime.client()),
            allocator_metrics,
        ));
        let admission = Admission::new(allocator, defaults, webhook_metrics);
        info!(?defaults, "Configured allocation defaults");

        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
