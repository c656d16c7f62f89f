//! Shared helpers for integration tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vigil::config::VigilConfig;
use vigil::resource::FixedProbe;
use vigil::workload::{RunMetrics, RunOutput, WorkloadBackend, WorkloadInput, WorkloadUnit};
use vigil::{Orchestrator, VigilError};

/// One backend call, as observed by [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Load(String),
    Prime(String),
    Run(String),
    Unload(String),
}

/// Pauses one `run` call: `entered` fires once the run starts, and the run
/// returns only after `release` is notified.
#[derive(Default)]
pub(crate) struct RunGate {
    pub(crate) entered: Notify,
    pub(crate) release: Notify,
}

/// Backend whose run outputs are scripted in order. An `Err` entry fails
/// that run; once the script is exhausted every run succeeds.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    calls: Mutex<Vec<Call>>,
    runs: Mutex<VecDeque<Result<String, String>>>,
    inputs: Mutex<Vec<WorkloadInput>>,
    fail_unload: Mutex<bool>,
    gate: Mutex<Option<Arc<RunGate>>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script_run(&self, outcome: Result<&str, &str>) {
        self.runs
            .lock()
            .unwrap()
            .push_back(outcome.map(str::to_owned).map_err(str::to_owned));
    }

    /// Hold the next run at a [`RunGate`].
    pub(crate) fn gate_next_run(&self) -> Arc<RunGate> {
        let gate = Arc::new(RunGate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn fail_unload(&self, fail: bool) {
        *self.fail_unload.lock().unwrap() = fail;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn inputs(&self) -> Vec<WorkloadInput> {
        self.inputs.lock().unwrap().clone()
    }

    pub(crate) fn load_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Load(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl WorkloadBackend for ScriptedBackend {
    async fn load(&self, unit: &WorkloadUnit) -> vigil::Result<()> {
        self.record(Call::Load(unit.identifier.clone()));
        Ok(())
    }

    async fn prime(&self, unit: &WorkloadUnit) -> vigil::Result<()> {
        self.record(Call::Prime(unit.identifier.clone()));
        Ok(())
    }

    async fn run(&self, unit: &WorkloadUnit, input: &WorkloadInput) -> vigil::Result<RunOutput> {
        self.record(Call::Run(unit.identifier.clone()));
        self.inputs.lock().unwrap().push(input.clone());
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let next = self.runs.lock().unwrap().pop_front();
        match next {
            Some(Err(message)) => Err(VigilError::Execution(message)),
            Some(Ok(text)) => Ok(RunOutput {
                text,
                metrics: RunMetrics {
                    prompt_tokens: 10,
                    output_tokens: 20,
                    backend_ms: 5,
                },
            }),
            None => Ok(RunOutput {
                text: format!("Finished {}.", input.description),
                metrics: RunMetrics::default(),
            }),
        }
    }

    async fn unload(&self, unit: &WorkloadUnit) -> vigil::Result<()> {
        self.record(Call::Unload(unit.identifier.clone()));
        if *self.fail_unload.lock().unwrap() {
            return Err(VigilError::Release("device busy".to_owned()));
        }
        Ok(())
    }

    async fn ping(&self) -> vigil::Result<()> {
        Ok(())
    }
}

/// Config with two small units and no self-heal delay.
pub(crate) fn test_config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.workloads = vec![
        WorkloadUnit::new("alpha", 1_000),
        WorkloadUnit::new("beta", 1_000),
    ];
    config.scheduler.heal_backoff_secs = 0;
    config
}

/// In-memory orchestrator over `backend` with a fixed resource reading.
pub(crate) fn in_memory(backend: &Arc<ScriptedBackend>, used: u64, total: u64) -> Orchestrator {
    Orchestrator::in_memory(
        &test_config(),
        Arc::clone(backend) as Arc<dyn WorkloadBackend>,
        Box::new(FixedProbe::new(used, total)),
    )
    .expect("build orchestrator")
}
