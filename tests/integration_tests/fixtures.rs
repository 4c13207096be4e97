//! Test fixtures for integration tests
//!
//! Unit processors with scripted behavior, for driving workers and runners.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use collector_lease::collector::{ProcessExit, UnitContext, UnitProcessor};

/// Fails every run
#[derive(Default)]
pub struct FailingProcessor {
    pub runs: AtomicU32,
}

#[async_trait]
impl UnitProcessor for FailingProcessor {
    async fn run(&self, _ctx: UnitContext) -> anyhow::Result<ProcessExit> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("chat gateway closed the connection")
    }
}

/// Fails `failures` times, then reports the channel live and holds the unit
pub struct FlakyProcessor {
    pub failures: u32,
    pub runs: AtomicU32,
}

impl FlakyProcessor {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            runs: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl UnitProcessor for FlakyProcessor {
    async fn run(&self, ctx: UnitContext) -> anyhow::Result<ProcessExit> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            anyhow::bail!("rate limited by platform");
        }
        ctx.record_live_state(true, 120).await?;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.record_activity().await?;
        }
    }
}
