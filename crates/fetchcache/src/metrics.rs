//! Statsd reporting for cache lookups, transport calls and purges.
//!
//! Nothing is sent until [`configure_statsd`] installed a client. Until then, and in tests,
//! every [`metric!`](crate::metric) invocation is a no-op.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<CacheMetrics> = OnceLock::new();

/// Traits needed by the expansion of [`metric!`](crate::metric).
pub mod prelude {
    pub use cadence::prelude::*;
}

/// The installed statsd client along with the tags attached to every metric.
#[derive(Debug)]
pub struct CacheMetrics {
    statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl CacheMetrics {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the configured default tags and sends the metric.
    #[inline]
    pub fn send<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.default_tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Installs the statsd client that all metrics are reported to.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host did not resolve to any address");
    };
    tracing::info!(%addr, prefix, "Reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let metrics = CacheMetrics {
        statsd: StatsdClient::from_sink(prefix, sink),
        default_tags,
    };
    if CLIENT.set(metrics).is_err() {
        tracing::debug!("Statsd is already configured");
    }
    Ok(())
}

/// Runs `f` with the installed client, if there is one.
#[inline]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&CacheMetrics),
{
    if let Some(client) = CLIENT.get() {
        f(client)
    }
}

/// Emits a counter, gauge or timer metric, with optional tags.
///
/// ```ignore
/// metric!(counter("caches.access") += 1);
/// metric!(timer("caches.transport.duration") = elapsed, "mode" => "async");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd().count_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd().gauge_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd().time_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };
}
