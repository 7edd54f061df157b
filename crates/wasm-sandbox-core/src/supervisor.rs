//! Per-call execution budget.
//!
//! The [`Supervisor`] arms a store before every guest call (fuel refill and
//! epoch deadline), classifies the outcome, and owns the epoch ticker that
//! makes the deadline advance in wall-clock time.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, warn};
use wasmtime::{Store, Trap};

use crate::WasmEngine;
use wasm_sandbox_common::{CodecError, ExecutionConfig, SandboxError};

/// Deadline enforcement and trap classification for guest calls.
#[derive(Debug, Clone)]
pub struct Supervisor {
    engine: WasmEngine,
    execution: ExecutionConfig,
}

impl Supervisor {
    /// Create a supervisor for calls on `engine`.
    pub fn new(engine: WasmEngine, execution: ExecutionConfig) -> Self {
        Self { engine, execution }
    }

    /// Get the execution configuration.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Number of epoch ticks a call may run before it is interrupted.
    pub fn deadline_ticks(&self) -> u64 {
        let tick = self.execution.epoch_tick_ms.max(1);
        self.execution.max_execution_ms.div_ceil(tick).max(1)
    }

    /// Reset the store's budget for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if fuel cannot be set on the store.
    pub fn arm<T>(&self, store: &mut Store<T>) -> Result<(), SandboxError> {
        let config = self.engine.config();

        if config.fuel_metering {
            store
                .set_fuel(self.execution.max_fuel)
                .map_err(|e| SandboxError::invalid_config(format!("Failed to set fuel: {e}")))?;
        }

        if config.epoch_interruption {
            store.set_epoch_deadline(self.deadline_ticks());
        }

        Ok(())
    }

    /// Await a guest call and translate its outcome.
    ///
    /// Without epoch interruption a call cannot be cancelled; one that ran
    /// past the deadline is still reported as a timeout once it returns.
    pub async fn run<F, R>(&self, export: &str, call: F) -> Result<R, SandboxError>
    where
        F: Future<Output = wasmtime::Result<R>>,
    {
        let start = Instant::now();
        let result = call.await;
        let elapsed = start.elapsed();

        match result {
            Ok(value) => {
                if !self.engine.config().epoch_interruption
                    && elapsed > self.execution.max_execution()
                {
                    warn!(
                        export,
                        duration_ms = elapsed.as_millis(),
                        "Guest call overran its deadline"
                    );
                    return Err(self.timeout());
                }

                debug!(export, duration_ms = elapsed.as_millis(), "Guest call completed");
                Ok(value)
            }
            Err(error) => {
                let classified = self.classify(&error);
                warn!(
                    export,
                    duration_ms = elapsed.as_millis(),
                    error = %classified,
                    "Guest call failed"
                );
                Err(classified)
            }
        }
    }

    /// Map a Wasmtime error onto the sandbox taxonomy.
    pub fn classify(&self, error: &wasmtime::Error) -> SandboxError {
        match error.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) => self.timeout(),
            Some(Trap::OutOfFuel) => SandboxError::FuelExhausted,
            Some(trap) => SandboxError::trap(trap.to_string()),
            None => SandboxError::trap(format!("{error:#}")),
        }
    }

    /// Map a codec failure onto the sandbox taxonomy.
    ///
    /// An allocator interrupted by the deadline is a timeout like any other.
    pub fn classify_codec(&self, error: CodecError) -> SandboxError {
        match error {
            CodecError::Interrupted => self.timeout(),
            other => other.into(),
        }
    }

    /// Start advancing the engine epoch every `epoch_tick_ms`.
    ///
    /// The ticker runs on its own thread so that a guest spinning on a
    /// runtime worker cannot starve it. Returns `None` when epoch
    /// interruption is disabled.
    pub fn start_epoch_ticker(&self) -> Option<EpochTicker> {
        if !self.engine.config().epoch_interruption {
            return None;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let engine = self.engine.clone();
        let tick = self.execution.epoch_tick();
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("wasm-sandbox-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            });

        match handle {
            Ok(handle) => {
                debug!(tick_ms = self.execution.epoch_tick_ms, "Epoch ticker started");
                Some(EpochTicker {
                    stop,
                    handle: Some(handle),
                })
            }
            Err(e) => {
                warn!(error = %e, "Failed to start epoch ticker; deadlines will not advance");
                None
            }
        }
    }

    fn timeout(&self) -> SandboxError {
        SandboxError::ExecutionTimeout {
            duration_ms: self.execution.max_execution_ms,
        }
    }
}

/// Handle to the background epoch ticker thread.
///
/// The ticker stops when [`EpochTicker::stop`] is called or the handle is dropped.
#[derive(Debug)]
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    /// Signal the ticker to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Epoch ticker thread panicked");
            }
        }
    }

    /// Whether the ticker is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        // The thread notices within one tick; no need to block here.
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::create_store;
    use wasm_sandbox_common::EngineConfig;

    fn supervisor(engine: EngineConfig, execution: ExecutionConfig) -> Supervisor {
        Supervisor::new(WasmEngine::new(&engine).unwrap(), execution)
    }

    #[test]
    fn test_deadline_ticks_round_up() {
        let sup = supervisor(
            EngineConfig::default(),
            ExecutionConfig {
                max_execution_ms: 25,
                epoch_tick_ms: 10,
                ..Default::default()
            },
        );
        assert_eq!(sup.deadline_ticks(), 3);

        let sup = supervisor(
            EngineConfig::default(),
            ExecutionConfig {
                max_execution_ms: 1,
                epoch_tick_ms: 10,
                ..Default::default()
            },
        );
        assert_eq!(sup.deadline_ticks(), 1);
    }

    #[test]
    fn test_arm_sets_fuel() {
        let sup = supervisor(
            EngineConfig {
                fuel_metering: true,
                ..Default::default()
            },
            ExecutionConfig {
                max_fuel: 1_000,
                ..Default::default()
            },
        );
        let mut store = create_store(&sup.engine, "mod-a");

        sup.arm(&mut store).unwrap();
        assert_eq!(store.get_fuel().unwrap(), 1_000);
    }

    #[test]
    fn test_classify_traps() {
        let sup = supervisor(EngineConfig::default(), ExecutionConfig::default());

        let err = sup.classify(&wasmtime::Error::new(Trap::Interrupt));
        assert!(matches!(err, SandboxError::ExecutionTimeout { duration_ms: 5_000 }));

        let err = sup.classify(&wasmtime::Error::new(Trap::OutOfFuel));
        assert!(matches!(err, SandboxError::FuelExhausted));

        let err = sup.classify(&wasmtime::Error::new(Trap::UnreachableCodeReached));
        assert!(matches!(err, SandboxError::Trap { .. }));

        let err = sup.classify(&wasmtime::Error::msg("host failure"));
        assert!(matches!(err, SandboxError::Trap { ref message } if message.contains("host failure")));
    }

    #[test]
    fn test_classify_codec_errors() {
        let sup = supervisor(EngineConfig::default(), ExecutionConfig::default());

        let err = sup.classify_codec(CodecError::Interrupted);
        assert!(matches!(err, SandboxError::ExecutionTimeout { duration_ms: 5_000 }));

        let err = sup.classify_codec(CodecError::OutOfFuel);
        assert!(matches!(err, SandboxError::FuelExhausted));

        let err = sup.classify_codec(CodecError::out_of_bounds(70_000, 4));
        assert!(matches!(err, SandboxError::MemoryFault { .. }));
    }

    #[tokio::test]
    async fn test_run_reports_overrun_without_interruption() {
        let sup = supervisor(
            EngineConfig {
                epoch_interruption: false,
                ..Default::default()
            },
            ExecutionConfig {
                max_execution_ms: 10,
                ..Default::default()
            },
        );

        let result = sup
            .run("__onMessage", async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, wasmtime::Error>(())
            })
            .await;
        assert!(matches!(result, Err(SandboxError::ExecutionTimeout { .. })));

        let result = sup.run("__onMessage", async { Ok::<_, wasmtime::Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_epoch_ticker_lifecycle() {
        let sup = supervisor(EngineConfig::default(), ExecutionConfig::default());
        let mut ticker = sup.start_epoch_ticker().unwrap();
        assert!(ticker.is_running());

        ticker.stop();
        assert!(!ticker.is_running());

        let sup = supervisor(
            EngineConfig {
                epoch_interruption: false,
                ..Default::default()
            },
            ExecutionConfig::default(),
        );
        assert!(sup.start_epoch_ticker().is_none());
    }
}
