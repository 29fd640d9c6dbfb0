//! Flow steps: tap, sleep, time, time_end

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::chain::Step;
use crate::context::RunnerContext;
use crate::error::{ChainError, ErrorKind};

fn timer_key(label: &str) -> String {
    format!("time:{}", label)
}

// ──────────────────────────────────────────────────────────
// tap — run a closure against the context
// ──────────────────────────────────────────────────────────

pub(crate) struct TapStep(pub Box<dyn Fn(&mut RunnerContext) + Send + Sync>);

#[async_trait]
impl Step for TapStep {
    fn name(&self) -> &str {
        "tap"
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        (self.0)(ctx);
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// sleep — pause the chain
// ──────────────────────────────────────────────────────────

pub(crate) struct SleepStep(pub Duration);

#[async_trait]
impl Step for SleepStep {
    fn name(&self) -> &str {
        "sleep"
    }

    fn describe(&self) -> String {
        format!("sleep {:?}", self.0)
    }

    async fn run(&self, _ctx: &mut RunnerContext) -> Result<(), ChainError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// time / time_end — measure the steps in between
// ──────────────────────────────────────────────────────────

pub(crate) struct TimeStep(pub String);

#[async_trait]
impl Step for TimeStep {
    fn name(&self) -> &str {
        "time"
    }

    fn describe(&self) -> String {
        format!("time {}", self.0)
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        ctx.set(timer_key(&self.0), Instant::now());
        Ok(())
    }
}

pub(crate) struct TimeEndStep(pub String, pub Box<dyn Fn(Duration) + Send + Sync>);

#[async_trait]
impl Step for TimeEndStep {
    fn name(&self) -> &str {
        "time_end"
    }

    fn describe(&self) -> String {
        format!("time_end {}", self.0)
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let start = ctx.get::<Instant>(&timer_key(&self.0)).copied().ok_or_else(|| {
            ChainError::new(ErrorKind::Other, format!("timer `{}` was never started", self.0))
        })?;
        let elapsed = start.elapsed();
        ctx.logf(&format!("[{}: {:?}]", self.0, elapsed));
        (self.1)(elapsed);
        Ok(())
    }
}
