use std::time::Duration;

use clap::Parser;

use crate::scheduler::{SchedulerConfig, TickSchedule};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Submission post queue")]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "database-url",
        env = "POSTQ_DATABASE_URL",
        help = "SQLite Connection URL",
        default_value = "sqlite://postq.db"
    )]
    pub database_url: String,

    #[arg(
        long = "max-connections",
        env = "POSTQ_MAX_CONNECTIONS",
        help = "Database pool size",
        default_value = "5"
    )]
    pub max_connections: u32,

    #[arg(
        long = "warm-up-secs",
        env = "POSTQ_WARM_UP_SECS",
        help = "Seconds to wait before the first execution tick",
        default_value = "60"
    )]
    pub warm_up_secs: u64,

    #[arg(
        long = "execute-interval-secs",
        env = "POSTQ_EXECUTE_INTERVAL_SECS",
        help = "Seconds between execution ticks",
        default_value = "1"
    )]
    pub execute_interval_secs: u64,

    #[arg(
        long = "promote-interval-secs",
        env = "POSTQ_PROMOTE_INTERVAL_SECS",
        help = "Seconds between scheduled submission checks",
        default_value = "30"
    )]
    pub promote_interval_secs: u64,

    #[arg(
        long = "disable-ticks",
        env = "POSTQ_DISABLE_TICKS",
        help = "Do not start the periodic ticks"
    )]
    pub disable_ticks: bool,

    #[arg(
        long = "jaeger-endpoint",
        env = "POSTQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,

    #[arg(
        long = "post-delay-ms",
        env = "POSTQ_POST_DELAY_MS",
        help = "Simulated posting time per website",
        default_value = "100"
    )]
    pub post_delay_ms: u64,

    #[arg(
        long = "demo-submissions",
        env = "POSTQ_DEMO_SUBMISSIONS",
        help = "Number of demo submissions to create and enqueue at start",
        default_value = "0"
    )]
    pub demo_submissions: u16,
}

impl ConfigContext {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            execute: TickSchedule {
                period: Duration::from_secs(self.execute_interval_secs.max(1)),
                delay: Duration::from_secs(self.warm_up_secs),
            },
            promote: TickSchedule {
                period: Duration::from_secs(self.promote_interval_secs.max(1)),
                delay: Duration::ZERO,
            },
            enabled: !self.disable_ticks,
        }
    }

    pub fn post_delay(&self) -> Duration {
        Duration::from_millis(self.post_delay_ms)
    }
}
