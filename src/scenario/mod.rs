//! Scenario Engine
//!
//! A scenario is an ordered list of steps driven over one peer
//! connection, with the processes under test supervised around it.
//! Steps execute strictly in declared order; the first failure
//! short-circuits the rest (no mid-stream resynchronization), and
//! teardown of every spawned process runs on every exit path.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::codec;
use crate::harness::{ProcessHandle, ProcessSpec};
use crate::matcher::Expectation;
use crate::protocol::Packet;
use crate::transport::{Listener, PeerLink, TlsClientConfig};

/// How long a scenario-run helper process gets to finish its job
const HELPER_EXIT_LIMIT: Duration = Duration::from_secs(30);

/// One step of a scenario
#[derive(Debug, Clone)]
pub enum Step {
    /// Encode and write this packet to the peer
    Send(Packet),
    /// Read one frame and match it, within the scenario's default
    /// receive deadline
    Expect(Expectation),
    /// Read one frame and match it within an explicit deadline
    /// (keep-alive checks)
    ExpectWithin(Expectation, Duration),
    /// Send this packet with its identifier replaced by the identifier
    /// of the most recently received packet. Acknowledgement chains use
    /// this when the peer under test owns the identifier.
    SendEchoingId(Packet),
    /// Expect the peer to close the connection
    ExpectClose,
    /// Spawn a helper process and require it to exit cleanly
    /// (e.g. a publisher feeding the broker under test)
    Run(ProcessSpec),
    /// Wait, letting the peers under test make progress (bridge
    /// establishment and similar)
    Pause(Duration),
}

/// Which side of the connection the framework plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Broker under test: the framework connects to its listening port
    ConnectToBroker,
    /// Client under test: the framework binds, listens, and accepts the
    /// connection the client initiates
    AcceptFromClient,
}

/// A complete test scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub role: PeerRole,
    /// Peer address: connected to or bound, depending on role
    pub addr: SocketAddr,
    /// TLS wrap for the active connection (broker scenarios only)
    pub tls: Option<TlsClientConfig>,
    /// Processes under test, spawned before the exchange begins
    pub processes: Vec<ProcessSpec>,
    pub steps: Vec<Step>,
    /// Pause between spawning processes and first socket contact
    pub startup_delay: Duration,
    /// Default deadline for each expect step
    pub recv_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long to wait for a client under test to connect
    pub accept_timeout: Duration,
}

impl Scenario {
    pub fn new(name: impl Into<String>, role: PeerRole, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            role,
            addr,
            tls: None,
            processes: Vec::new(),
            steps: Vec::new(),
            startup_delay: crate::harness::DEFAULT_STARTUP_DELAY,
            recv_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(10),
        }
    }

    pub fn process(mut self, spec: ProcessSpec) -> Self {
        self.processes.push(spec);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn send(self, packet: Packet) -> Self {
        self.step(Step::Send(packet))
    }

    pub fn expect(self, expectation: Expectation) -> Self {
        self.step(Step::Expect(expectation))
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_recv_timeout(mut self, limit: Duration) -> Self {
        self.recv_timeout = limit;
        self
    }
}

/// Why a scenario failed, tied to the step that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Index into the scenario's step list; `usize::MAX` for failures
    /// before the first step (spawn, connect, accept)
    pub step: usize,
    pub reason: String,
}

impl StepFailure {
    fn setup(reason: String) -> Self {
        Self {
            step: usize::MAX,
            reason,
        }
    }

    pub fn is_setup_failure(&self) -> bool {
        self.step == usize::MAX
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_setup_failure() {
            write!(f, "setup: {}", self.reason)
        } else {
            write!(f, "step {}: {}", self.step, self.reason)
        }
    }
}

/// Final verdict for one scenario run
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub failure: Option<StepFailure>,
    /// Captured stderr of each process under test, gathered only on
    /// failure so passing runs stay silent
    pub process_stderr: Vec<(String, String)>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// The exit-code contract consumed by the orchestration layer
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

/// Drives one scenario from spawn to teardown
pub struct ScenarioRunner;

impl ScenarioRunner {
    pub async fn run(scenario: Scenario) -> ScenarioOutcome {
        info!(scenario = %scenario.name, "running");

        let mut processes: Vec<ProcessHandle> = Vec::new();
        let result = Self::run_inner(&scenario, &mut processes).await;

        // Teardown is unconditional: passed, failed, or died early,
        // every process that started gets terminated and awaited
        for handle in &mut processes {
            handle.terminate().await;
        }

        let mut process_stderr = Vec::new();
        if let Err(failure) = &result {
            error!(scenario = %scenario.name, %failure, "failed");
            for handle in &mut processes {
                let output = handle.stderr_output().await;
                if !output.is_empty() {
                    process_stderr.push((handle.name().to_string(), output));
                }
            }
        } else {
            info!(scenario = %scenario.name, "passed");
        }

        ScenarioOutcome {
            name: scenario.name,
            failure: result.err(),
            process_stderr,
        }
    }

    async fn run_inner(
        scenario: &Scenario,
        processes: &mut Vec<ProcessHandle>,
    ) -> Result<(), StepFailure> {
        let mut link = match scenario.role {
            PeerRole::ConnectToBroker => {
                spawn_all(&scenario.processes, processes)?;
                tokio::time::sleep(scenario.startup_delay).await;
                check_still_running(processes)?;

                let link = match &scenario.tls {
                    None => PeerLink::connect(scenario.addr, scenario.connect_timeout).await,
                    Some(tls) => {
                        PeerLink::connect_tls(scenario.addr, tls, scenario.connect_timeout).await
                    }
                };
                link.map_err(|e| {
                    StepFailure::setup(format!("connecting to {}: {}", scenario.addr, e))
                })?
            }
            PeerRole::AcceptFromClient => {
                // Bind before spawning so the client under test cannot
                // race the listener
                let listener = Listener::bind(scenario.addr).map_err(|e| {
                    StepFailure::setup(format!("binding {}: {}", scenario.addr, e))
                })?;

                spawn_all(&scenario.processes, processes)?;

                listener
                    .accept(scenario.accept_timeout)
                    .await
                    .map_err(|e| StepFailure::setup(format!("waiting for client: {}", e)))?
            }
        };

        // Identifier of the most recently received packet, for
        // acknowledgements that must echo a peer-chosen identifier
        let mut last_packet_id: Option<u16> = None;

        for (index, step) in scenario.steps.iter().enumerate() {
            Self::run_step(scenario, &mut link, processes, &mut last_packet_id, index, step)
                .await
                .map_err(|reason| StepFailure {
                    step: index,
                    reason,
                })?;
        }

        Ok(())
    }

    async fn run_step(
        scenario: &Scenario,
        link: &mut PeerLink,
        processes: &mut Vec<ProcessHandle>,
        last_packet_id: &mut Option<u16>,
        index: usize,
        step: &Step,
    ) -> Result<(), String> {
        match step {
            Step::Send(packet) => Self::send(link, packet, index).await,
            Step::SendEchoingId(packet) => {
                let id = last_packet_id
                    .ok_or_else(|| "no peer packet identifier observed yet".to_string())?;
                Self::send(link, &packet.with_packet_id(id), index).await
            }
            Step::Expect(expectation) => {
                Self::expect(link, expectation, scenario.recv_timeout, last_packet_id, index).await
            }
            Step::ExpectWithin(expectation, limit) => {
                Self::expect(link, expectation, *limit, last_packet_id, index).await
            }
            Step::ExpectClose => {
                debug!(step = index, "expect close");
                if link.expect_close(scenario.recv_timeout).await {
                    Ok(())
                } else {
                    Err("peer did not close the connection".to_string())
                }
            }
            Step::Run(spec) => {
                debug!(step = index, helper = %spec.name, "run helper");
                let handle = ProcessHandle::spawn(spec)
                    .map_err(|e| e.to_string())?;
                processes.push(handle);
                let handle = processes.last_mut().unwrap();
                match handle.wait_exit(HELPER_EXIT_LIMIT).await {
                    Some(status) if status.success() => Ok(()),
                    Some(status) => Err(format!("helper '{}' failed: {}", spec.name, status)),
                    None => Err(format!("helper '{}' did not exit", spec.name)),
                }
            }
            Step::Pause(duration) => {
                debug!(step = index, ?duration, "pause");
                tokio::time::sleep(*duration).await;
                Ok(())
            }
        }
    }

    async fn send(link: &mut PeerLink, packet: &Packet, index: usize) -> Result<(), String> {
        debug!(step = index, packet = %packet.packet_type(), "send");
        let bytes = codec::encode_to_bytes(packet)
            .map_err(|e| format!("encoding {}: {}", packet.packet_type(), e))?;
        link.send(&bytes)
            .await
            .map_err(|e| format!("sending {}: {}", packet.packet_type(), e))
    }

    async fn expect(
        link: &mut PeerLink,
        expectation: &Expectation,
        limit: Duration,
        last_packet_id: &mut Option<u16>,
        index: usize,
    ) -> Result<(), String> {
        let wanted = expectation.packet().packet_type();
        debug!(step = index, packet = %wanted, "expect");

        let frame = link
            .recv_frame(limit)
            .await
            .map_err(|e| format!("waiting for {}: {}", wanted, e))?;

        let outcome = expectation.matches(&frame);
        if outcome.is_match() {
            if let Ok(Some((packet, _))) = codec::decode(&frame) {
                if let Some(id) = packet.packet_id() {
                    *last_packet_id = Some(id);
                }
            }
            return Ok(());
        }

        let expected_bytes = codec::encode_to_bytes(expectation.packet())
            .map(|b| byte_list(&b))
            .unwrap_or_else(|_| "<unencodable>".to_string());
        Err(format!(
            "{}; expected [{}] got [{}]",
            outcome,
            expected_bytes,
            byte_list(&frame)
        ))
    }
}

fn spawn_all(
    specs: &[ProcessSpec],
    processes: &mut Vec<ProcessHandle>,
) -> Result<(), StepFailure> {
    for spec in specs {
        // Every successfully spawned process lands in the teardown list
        // before the next spawn can fail
        let handle =
            ProcessHandle::spawn(spec).map_err(|e| StepFailure::setup(e.to_string()))?;
        processes.push(handle);
    }
    Ok(())
}

fn check_still_running(processes: &mut [ProcessHandle]) -> Result<(), StepFailure> {
    for handle in processes {
        if let Some(status) = handle.exit_status() {
            return Err(StepFailure::setup(format!(
                "'{}' exited before the exchange began: {}",
                handle.name(),
                status
            )));
        }
    }
    Ok(())
}

/// Bytes as the decimal list the failure output uses (e.g. "32,2,0,0")
fn byte_list(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
