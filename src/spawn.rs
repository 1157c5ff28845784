use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::env::{self, EnvMap, LaunchEnv};
use crate::error::{OrchestratorError, ReentrantSpawnError, Result};
use crate::rendezvous::RendezvousAddr;

static PROCESS_GUARD: OnceLock<SpawnGuard> = OnceLock::new();

/// Remembers whether siblings were already launched. Clones share one flag;
/// [`SpawnGuard::process`] hands out the flag of the running process, so
/// every spawner built in this process sees the same state.
#[derive(Debug, Clone)]
pub struct SpawnGuard {
    spawned: Arc<AtomicBool>,
}

impl SpawnGuard {
    pub fn process() -> Self {
        PROCESS_GUARD.get_or_init(Self::detached).clone()
    }

    /// A guard with its own flag, for hosting isolated jobs.
    pub fn detached() -> Self {
        Self {
            spawned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the guard, failing if it was already marked.
    pub fn claim(&self) -> Result<(), ReentrantSpawnError> {
        self.spawned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ReentrantSpawnError)
    }

    pub fn has_spawned(&self) -> bool {
        self.spawned.load(Ordering::Acquire)
    }
}

/// Program and arguments every sibling re-runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The command line of the running process with the program made
    /// absolute, so children still find it after a working-directory change.
    pub fn current(original_cwd: Option<&Path>) -> Self {
        let mut argv = std::env::args_os();
        let argv0 = argv.next().unwrap_or_default();
        let args: Vec<OsString> = argv.collect();
        let program = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                warn!("could not read the current executable path ({e}), resolving argv[0] instead");
                resolve_program_path(Path::new(&argv0), original_cwd)
            }
        };
        Self { program, args }
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Absolute form of `raw`, resolved against `original_cwd` when given.
///
/// Resolution failures fall back to joining the current directory; the
/// fallback is logged because a wrong path only surfaces when a child fails
/// to start.
pub fn resolve_program_path(raw: &Path, original_cwd: Option<&Path>) -> PathBuf {
    if raw.is_absolute() {
        return raw.to_path_buf();
    }
    let joined = match original_cwd {
        Some(base) => base.join(raw),
        None => raw.to_path_buf(),
    };
    match std::path::absolute(&joined) {
        Ok(path) => path,
        Err(e) => {
            warn!("failed to resolve {} ({e}), using a best-effort absolute path", joined.display());
            std::env::current_dir()
                .map(|cwd| cwd.join(&joined))
                .unwrap_or(joined)
        }
    }
}

/// A launched sibling as seen by its parent.
pub trait ChildProcess: Send {
    fn id(&self) -> u32;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
    fn kill(&mut self) -> io::Result<()>;
}

impl ChildProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }
}

pub trait ProcessLauncher: Send {
    fn launch(
        &mut self,
        command: &CommandLine,
        env: &EnvMap,
        cwd: Option<&Path>,
    ) -> io::Result<Box<dyn ChildProcess>>;
}

/// Starts real OS processes with exactly the given environment.
#[derive(Debug, Default)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(
        &mut self,
        command: &CommandLine,
        env: &EnvMap,
        cwd: Option<&Path>,
    ) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = command.to_command();
        cmd.env_clear().envs(env.iter());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        Ok(Box::new(cmd.spawn()?))
    }
}

/// Pause between launches. Starting every worker at once makes their data
/// loaders race for the same resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stagger {
    Uniform { min: Duration, max: Duration },
    Disabled,
}

impl Default for Stagger {
    fn default() -> Self {
        Stagger::Uniform {
            min: Duration::from_secs(1),
            max: Duration::from_secs(5),
        }
    }
}

impl Stagger {
    pub fn next_delay(&self) -> Duration {
        match *self {
            Stagger::Disabled => Duration::ZERO,
            Stagger::Uniform { min, max } if max <= min => min,
            Stagger::Uniform { min, max } => {
                let secs = rand::rng().random_range(min.as_secs_f64()..max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }
}

pub struct SpawnRecord {
    pub local_rank: usize,
    pub command_line: CommandLine,
    pub environment: EnvMap,
    pub process: Box<dyn ChildProcess>,
}

impl fmt::Debug for SpawnRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnRecord")
            .field("local_rank", &self.local_rank)
            .field("command_line", &self.command_line)
            .field("pid", &self.process.id())
            .finish()
    }
}

/// Children launched by this process. Cloning shares the same list, so a
/// signal handler can terminate children the spawner started.
#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    records: Arc<Mutex<Vec<SpawnRecord>>>,
}

impl ChildRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<SpawnRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, record: SpawnRecord) {
        self.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs `f` over the records without removing them.
    pub fn inspect<T>(&self, f: impl FnOnce(&[SpawnRecord]) -> T) -> T {
        f(&self.lock())
    }

    /// Blocks until every child exits and drops its record.
    pub fn wait_all(&self) -> Vec<(usize, io::Result<ExitStatus>)> {
        let records = std::mem::take(&mut *self.lock());
        records
            .into_iter()
            .map(|mut record| {
                let status = record.process.wait();
                match &status {
                    Ok(status) if status.success() => info!("✅ worker {} exited cleanly", record.local_rank),
                    Ok(status) => warn!("worker {} exited with {:?}", record.local_rank, status.code()),
                    Err(e) => warn!("failed to reap worker {}: {}", record.local_rank, e),
                }
                (record.local_rank, status)
            })
            .collect()
    }

    /// Kills every child that is still running and reaps them all.
    pub fn terminate_all(&self) {
        let mut records = self.lock();
        for record in records.iter_mut() {
            if let Ok(None) = record.process.try_wait() {
                info!("🧹 terminating worker {} (pid {})", record.local_rank, record.process.id());
                if let Err(e) = record.process.kill() {
                    warn!("failed to terminate worker {}: {}", record.local_rank, e);
                }
            }
            let _ = record.process.wait();
        }
        records.clear();
    }
}

/// What the master fixed before launching its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOutcome {
    pub rendezvous: RendezvousAddr,
    pub node_rank: usize,
    pub world_size: usize,
    pub task_idx: usize,
}

/// Turns the current process into the coordination master and replicates it.
pub struct ProcessSpawner {
    launcher: Box<dyn ProcessLauncher>,
    guard: SpawnGuard,
    stagger: Stagger,
    children: ChildRegistry,
    original_cwd: Option<PathBuf>,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self::new(Box::new(OsLauncher))
    }
}

impl ProcessSpawner {
    pub fn new(launcher: Box<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            guard: SpawnGuard::process(),
            stagger: Stagger::default(),
            children: ChildRegistry::default(),
            original_cwd: None,
        }
    }

    pub fn with_guard(mut self, guard: SpawnGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_stagger(mut self, stagger: Stagger) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_original_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.original_cwd = cwd;
        self
    }

    pub fn with_registry(mut self, children: ChildRegistry) -> Self {
        self.children = children;
        self
    }

    pub fn children(&self) -> &ChildRegistry {
        &self.children
    }

    pub fn has_spawned(&self) -> bool {
        self.guard.has_spawned()
    }

    pub fn spawn_children(
        &mut self,
        global_rank: usize,
        env: &mut EnvMap,
        command: &CommandLine,
        num_processes: usize,
        num_nodes: usize,
    ) -> Result<SpawnOutcome> {
        if global_rank != 0 {
            return Err(OrchestratorError::NotCoordinationMaster(global_rank));
        }
        self.guard.claim()?;

        let rendezvous = RendezvousAddr::for_spawn(env)?;
        rendezvous.export(env);

        // operator-supplied node rank, overridden by the elastic group rank
        let node_rank_raw = env
            .get(env::GROUP_RANK)
            .or_else(|| env.get(env::NODE_RANK))
            .unwrap_or("0")
            .to_string();
        let node_rank: usize = node_rank_raw.trim().parse().map_err(|_| {
            OrchestratorError::configuration(format!(
                "node rank {node_rank_raw:?} from GROUP_RANK/NODE_RANK is not an integer"
            ))
        })?;

        // the master's visible devices were already scoped upstream; forward
        // them untouched so children see the same selection
        let gpu_ids = env.get(env::CUDA_VISIBLE_DEVICES).unwrap_or_default().to_string();
        let visible = gpu_ids.split(',').filter(|id| !id.trim().is_empty()).count();
        let trainer_gpus = match visible {
            0 => None,
            1 if !gpu_ids.contains(',') => Some(format!("{gpu_ids},")),
            _ => Some(gpu_ids.clone()),
        };
        // with no visible devices the configured process count sets the
        // per-node width, so CPU script runs still get one rank per process
        let per_node = if visible == 0 { num_processes } else { visible }.max(1);
        let world_size = per_node * num_nodes;

        let launch = LaunchEnv {
            master_addr: rendezvous.addr.clone(),
            master_port: rendezvous.port,
            node_rank,
            local_rank: 0,
            world_size,
            trainer_gpus,
        };
        launch.export(env)?;

        info!(
            "🌟 spawning {} sibling workers, rendezvous at {}",
            num_processes.saturating_sub(1),
            rendezvous.socket_addr()
        );
        for local_rank in 1..num_processes {
            let mut child_env = env.clone();
            LaunchEnv {
                local_rank,
                ..launch.clone()
            }
            .export(&mut child_env)?;

            let process = self
                .launcher
                .launch(command, &child_env, self.original_cwd.as_deref())?;
            info!("🚀 started worker {} (pid {})", local_rank, process.id());
            self.children.push(SpawnRecord {
                local_rank,
                command_line: command.clone(),
                environment: child_env,
                process,
            });

            let delay = self.stagger.next_delay();
            if !delay.is_zero() {
                debug!("waiting {:.2}s before the next launch", delay.as_secs_f64());
                thread::sleep(delay);
            }
        }

        Ok(SpawnOutcome {
            rendezvous,
            node_rank,
            world_size,
            task_idx: 0,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    pub(crate) struct FakeChild {
        pub pid: u32,
    }

    impl ChildProcess for FakeChild {
        fn id(&self) -> u32 {
            self.pid
        }
        fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
            Ok(Some(ExitStatus::from_raw(0)))
        }
        fn wait(&mut self) -> io::Result<ExitStatus> {
            Ok(ExitStatus::from_raw(0))
        }
        fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingLauncher {
        pub launched: Arc<Mutex<Vec<(CommandLine, EnvMap, Option<PathBuf>)>>>,
    }

    impl ProcessLauncher for RecordingLauncher {
        fn launch(
            &mut self,
            command: &CommandLine,
            env: &EnvMap,
            cwd: Option<&Path>,
        ) -> io::Result<Box<dyn ChildProcess>> {
            let mut launched = self.launched.lock().unwrap();
            launched.push((command.clone(), env.clone(), cwd.map(Path::to_path_buf)));
            Ok(Box::new(FakeChild {
                pid: 1000 + launched.len() as u32,
            }))
        }
    }

    fn spawner() -> ProcessSpawner {
        ProcessSpawner::new(Box::new(RecordingLauncher::default()))
            .with_guard(SpawnGuard::detached())
            .with_stagger(Stagger::Disabled)
    }

    fn command() -> CommandLine {
        CommandLine::new("/opt/train/bin/ddp-train", ["fit", "--config", "run.json"])
    }

    #[test]
    fn spawns_one_record_per_sibling() {
        let mut spawner = spawner();
        let mut env = EnvMap::new();
        let outcome = spawner.spawn_children(0, &mut env, &command(), 4, 1).unwrap();

        assert_eq!(outcome.task_idx, 0);
        assert_eq!(env.get(env::LOCAL_RANK), Some("0"));
        spawner.children().inspect(|records| {
            assert_eq!(records.len(), 3);
            let ranks: Vec<&str> = records
                .iter()
                .map(|r| r.environment.get(env::LOCAL_RANK).unwrap())
                .collect();
            assert_eq!(ranks, ["1", "2", "3"]);
            assert!(records.iter().all(|r| r.command_line == command()));
            for record in records {
                let launch = LaunchEnv::from_env(&record.environment).unwrap().unwrap();
                assert_eq!(launch.local_rank, record.local_rank);
                assert_eq!(launch.master_port, outcome.rendezvous.port);
            }
        });
    }

    #[test]
    fn second_spawn_is_rejected_and_keeps_one_set() {
        let mut spawner = spawner();
        let mut env = EnvMap::new();
        spawner.spawn_children(0, &mut env, &command(), 3, 1).unwrap();
        let err = spawner.spawn_children(0, &mut env, &command(), 3, 1).unwrap_err();

        assert!(matches!(err, OrchestratorError::ReentrantSpawn(ReentrantSpawnError)));
        assert_eq!(spawner.children().len(), 2);
    }

    #[test]
    fn spawners_sharing_a_guard_spawn_once() {
        let guard = SpawnGuard::detached();
        let mut first = spawner().with_guard(guard.clone());
        let mut second = spawner().with_guard(guard.clone());
        let mut env = EnvMap::new();

        first.spawn_children(0, &mut env, &command(), 3, 1).unwrap();
        let err = second.spawn_children(0, &mut env, &command(), 3, 1).unwrap_err();
        assert!(matches!(err, OrchestratorError::ReentrantSpawn(ReentrantSpawnError)));
        assert_eq!(first.children().len(), 2);
        assert!(second.children().is_empty());
        assert!(guard.has_spawned());
    }

    #[test]
    fn default_spawners_share_the_process_guard() {
        let a = ProcessSpawner::default();
        let b = ProcessSpawner::default();
        assert!(Arc::ptr_eq(&a.guard.spawned, &b.guard.spawned));
        assert!(!Arc::ptr_eq(&SpawnGuard::detached().spawned, &a.guard.spawned));
    }

    #[test]
    fn only_rank_zero_may_spawn() {
        let mut spawner = spawner();
        let err = spawner
            .spawn_children(2, &mut EnvMap::new(), &command(), 3, 1)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotCoordinationMaster(2)));
        assert!(!spawner.has_spawned());
    }

    #[test]
    fn cpu_world_size_counts_processes_per_node() {
        let mut spawner = spawner();
        let mut env = EnvMap::new();
        spawner.spawn_children(0, &mut env, &command(), 3, 2).unwrap();

        assert_eq!(env.get(env::WORLD_SIZE), Some("6"));
        assert_eq!(env.get(env::TRAINER_GPUS), None);

        let mut env: EnvMap = [(env::CUDA_VISIBLE_DEVICES, "0,1")].into_iter().collect();
        self::spawner().spawn_children(0, &mut env, &command(), 2, 2).unwrap();
        assert_eq!(env.get(env::WORLD_SIZE), Some("4"));
    }

    #[test]
    fn group_rank_wins_over_node_rank() {
        let mut spawner = spawner();
        let mut env: EnvMap = [(env::NODE_RANK, "1"), (env::GROUP_RANK, "2")].into_iter().collect();
        let outcome = spawner.spawn_children(0, &mut env, &command(), 1, 3).unwrap();
        assert_eq!(outcome.node_rank, 2);
        assert_eq!(env.get(env::NODE_RANK), Some("2"));
    }

    #[test]
    fn world_size_follows_visible_devices_and_nodes() {
        let mut spawner = spawner();
        let mut env: EnvMap = [(env::CUDA_VISIBLE_DEVICES, "2,5")].into_iter().collect();
        let outcome = spawner.spawn_children(0, &mut env, &command(), 2, 2).unwrap();
        assert_eq!(outcome.world_size, 4);
        assert_eq!(env.get(env::WORLD_SIZE), Some("4"));
        assert_eq!(env.get(env::TRAINER_GPUS), Some("2,5"));
    }

    #[test]
    fn single_visible_device_is_forwarded_as_a_list() {
        let mut spawner = spawner();
        let mut env: EnvMap = [(env::CUDA_VISIBLE_DEVICES, "3")].into_iter().collect();
        spawner.spawn_children(0, &mut env, &command(), 1, 1).unwrap();
        assert_eq!(env.get(env::TRAINER_GPUS), Some("3,"));
    }

    #[test]
    fn children_start_in_the_original_directory() {
        let launcher = RecordingLauncher::default();
        let launched = launcher.launched.clone();
        let mut spawner = ProcessSpawner::new(Box::new(launcher))
            .with_guard(SpawnGuard::detached())
            .with_stagger(Stagger::Disabled)
            .with_original_cwd(Some(PathBuf::from("/work/project")));
        spawner.spawn_children(0, &mut EnvMap::new(), &command(), 2, 1).unwrap();

        let launched = launched.lock().unwrap();
        assert_eq!(launched[0].2.as_deref(), Some(Path::new("/work/project")));
    }

    #[test]
    fn relative_program_resolves_against_original_cwd() {
        let resolved = resolve_program_path(Path::new("bin/train"), Some(Path::new("/srv/job")));
        assert_eq!(resolved, PathBuf::from("/srv/job/bin/train"));
        assert!(resolve_program_path(Path::new("train"), None).is_absolute());
    }

    #[test]
    fn stagger_stays_in_range() {
        let stagger = Stagger::Uniform {
            min: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        for _ in 0..50 {
            let delay = stagger.next_delay();
            assert!(delay >= Duration::from_millis(10) && delay < Duration::from_millis(20));
        }
        assert_eq!(Stagger::Disabled.next_delay(), Duration::ZERO);
    }
}
