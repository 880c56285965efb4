//! In-memory [`Host`] for tests and demos.
//!
//! [`FakeHost`] models a small object graph addressed by slash-separated
//! paths (`Worksheets/Sheet1/ChartObjects`). Every object handed out gets a
//! fresh [`ObjectId`] and is tracked until released, so tests can assert that
//! nothing leaked and nothing was released twice. Faults and hangs can be
//! scripted per member name.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use excel_com_protocol::{ObjectId, Variant};
use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, HostFault, Result};
use crate::host::{Host, HostLauncher, LaunchRequest};

/// `RPC_E_DISCONNECTED`: the object invoked has disconnected from its clients.
pub const RPC_E_DISCONNECTED: u32 = 0x8001_0108;
const DISP_E_UNKNOWNNAME: u32 = 0x8002_0006;
const DISP_E_BADINDEX: u32 = 0x8002_000B;
const E_FAIL: u32 = 0x8000_4005;

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

const ROOT: ObjectId = ObjectId(1);

#[derive(Debug)]
struct ScriptedFault {
    member: String,
    hresult: u32,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Graph {
    next_id: u64,
    nodes: BTreeSet<String>,
    values: HashMap<(String, String), Variant>,
    live: HashMap<ObjectId, String>,
    root_released: bool,
    release_log: Vec<ObjectId>,
    release_calls: usize,
    double_releases: usize,
    fail_releases: bool,
    faults: Vec<ScriptedFault>,
    calls: HashMap<String, usize>,
    saves: Vec<Option<String>>,
    visible: bool,
    quit: bool,
    calls_after_quit: usize,
}

impl Graph {
    fn path_of(&self, target: ObjectId) -> Option<String> {
        if target == ROOT {
            return (!self.root_released).then(String::new);
        }
        self.live.get(&target).cloned()
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_path(path, "");
        self.nodes
            .iter()
            .filter(|n| n.starts_with(&prefix) && !n[prefix.len()..].contains('/'))
            .cloned()
            .collect()
    }

    fn hand_out(&mut self, path: String) -> Variant {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.live.insert(id, path);
        Variant::Object { handle: id }
    }

    fn take_fault(&mut self, member: &str) -> Option<u32> {
        let idx = self.faults.iter().position(|f| f.member == member)?;
        let fault = &mut self.faults[idx];
        let hresult = fault.hresult;
        let exhausted = match fault.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(idx);
        }
        Some(hresult)
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn key_of(arg: Option<&Variant>) -> Option<String> {
    match arg? {
        Variant::String(s) => Some(s.clone()),
        Variant::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Hangs {
    members: HashSet<String>,
    waiting: usize,
}

/// In-memory stand-in for a host process.
#[derive(Debug)]
pub struct FakeHost {
    pid: u32,
    graph: Mutex<Graph>,
    hangs: Mutex<Hangs>,
    hang_cv: Condvar,
    terminated: AtomicBool,
}

impl FakeHost {
    /// A host with a workbook containing `Worksheets/Sheet1/ChartObjects` and
    /// an empty `Names` collection.
    pub fn new() -> Arc<Self> {
        Self::with_nodes(["Worksheets", "Worksheets/Sheet1", "Worksheets/Sheet1/ChartObjects", "Names"])
    }

    /// A host whose graph contains exactly `nodes` (plus the root).
    pub fn with_nodes<I, S>(nodes: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let graph = Graph {
            next_id: ROOT.0,
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Graph::default()
        };
        Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            graph: Mutex::new(graph),
            hangs: Mutex::new(Hangs::default()),
            hang_cv: Condvar::new(),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn add_node(&self, path: &str) {
        self.graph.lock().nodes.insert(path.to_string());
    }

    /// Seed a scalar property on the object at `path` (`""` is the root).
    pub fn set_value(&self, path: &str, name: &str, value: impl Into<Variant>) {
        self.graph
            .lock()
            .values
            .insert((path.to_string(), name.to_string()), value.into());
    }

    /// Current value of a scalar property.
    pub fn value(&self, path: &str, name: &str) -> Option<Variant> {
        self.graph
            .lock()
            .values
            .get(&(path.to_string(), name.to_string()))
            .cloned()
    }

    /// Fail calls to `member` with `hresult`, `times` times or forever.
    pub fn fail_on(&self, member: &str, hresult: u32, times: Option<usize>) {
        self.graph.lock().faults.push(ScriptedFault {
            member: member.to_string(),
            hresult,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.graph.lock().faults.clear();
    }

    /// Block calls to `member` until [`release_hangs`](Self::release_hangs)
    /// or [`terminate`](Host::terminate).
    pub fn hang_on(&self, member: &str) {
        self.hangs.lock().members.insert(member.to_string());
    }

    pub fn release_hangs(&self) {
        self.hangs.lock().members.clear();
        self.hang_cv.notify_all();
    }

    /// Number of calls currently blocked in a hang.
    pub fn hung_calls(&self) -> usize {
        self.hangs.lock().waiting
    }

    /// Poll until at least one call is blocked in a hang.
    pub fn wait_for_hung_call(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.hung_calls() > 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    pub fn fail_releases(&self, fail: bool) {
        self.graph.lock().fail_releases = fail;
    }

    /// Ids passed to `release`, in call order.
    pub fn release_log(&self) -> Vec<ObjectId> {
        self.graph.lock().release_log.clone()
    }

    pub fn release_calls(&self) -> usize {
        self.graph.lock().release_calls
    }

    /// Releases of ids that were not live at the time.
    pub fn double_releases(&self) -> usize {
        self.graph.lock().double_releases
    }

    /// Handed-out objects not yet released, excluding the root.
    pub fn live_handles(&self) -> usize {
        self.graph.lock().live.len()
    }

    pub fn root_released(&self) -> bool {
        self.graph.lock().root_released
    }

    /// Calls received for `member`, counting failed ones.
    pub fn calls(&self, member: &str) -> usize {
        self.graph.lock().calls.get(member).copied().unwrap_or(0)
    }

    pub fn saves(&self) -> Vec<Option<String>> {
        self.graph.lock().saves.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.graph.lock().visible
    }

    pub fn has_quit(&self) -> bool {
        self.graph.lock().quit
    }

    /// Calls that reached the host after it was told to quit.
    pub fn calls_after_quit(&self) -> usize {
        self.graph.lock().calls_after_quit
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Common prologue of every call: count it, honour hangs, then fail if
    /// the process is gone or a fault is scripted.
    fn enter(&self, member: &str, operation: impl Fn() -> String) -> std::result::Result<(), HostFault> {
        {
            let mut graph = self.graph.lock();
            *graph.calls.entry(member.to_string()).or_default() += 1;
            if graph.quit {
                graph.calls_after_quit += 1;
            }
        }

        {
            let mut hangs = self.hangs.lock();
            while hangs.members.contains(member) && !self.is_terminated() {
                hangs.waiting += 1;
                self.hang_cv.wait(&mut hangs);
                hangs.waiting -= 1;
            }
        }

        if self.is_terminated() {
            return Err(HostFault::new(operation(), "host process has exited")
                .with_hresult(RPC_E_DISCONNECTED as i32));
        }
        if let Some(hresult) = self.graph.lock().take_fault(member) {
            return Err(HostFault::new(operation(), "scripted fault").with_hresult(hresult as i32));
        }
        Ok(())
    }

    fn resolve(
        &self,
        kind: &str,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> std::result::Result<Variant, HostFault> {
        let operation = || format!("{kind}({name}) on {target}");
        self.enter(name, operation)?;

        let mut graph = self.graph.lock();
        let path = graph.path_of(target).ok_or_else(|| {
            HostFault::new(operation(), "object is not live").with_hresult(E_FAIL as i32)
        })?;

        match name {
            "Count" => return Ok(Variant::Number(graph.children(&path).len() as f64)),
            "Item" => {
                let children = graph.children(&path);
                let found = match args.first() {
                    Some(Variant::Number(n)) if *n >= 1.0 => children.get(*n as usize - 1).cloned(),
                    other => key_of(other)
                        .map(|key| child_path(&path, &key))
                        .filter(|p| graph.nodes.contains(p)),
                };
                return match found {
                    Some(child) => Ok(graph.hand_out(child)),
                    None => Err(HostFault::new(operation(), "index out of range")
                        .with_hresult(DISP_E_BADINDEX as i32)),
                };
            }
            "Name" if !path.is_empty() => {
                let leaf = path.rsplit('/').next().unwrap_or_default();
                return Ok(Variant::String(leaf.to_string()));
            }
            _ => {}
        }

        let child = child_path(&path, name);
        if graph.nodes.contains(&child) {
            return Ok(graph.hand_out(child));
        }
        if let Some(value) = graph.values.get(&(path, name.to_string())) {
            return Ok(value.clone());
        }
        Err(HostFault::new(operation(), "unknown name").with_hresult(DISP_E_UNKNOWNNAME as i32))
    }
}

impl Host for FakeHost {
    fn root(&self) -> ObjectId {
        ROOT
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn get_property(
        &self,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> std::result::Result<Variant, HostFault> {
        self.resolve("GetProperty", target, name, args)
    }

    fn set_property(
        &self,
        target: ObjectId,
        name: &str,
        value: Variant,
    ) -> std::result::Result<(), HostFault> {
        let operation = || format!("SetProperty({name}) on {target}");
        self.enter(name, operation)?;
        let mut graph = self.graph.lock();
        let path = graph.path_of(target).ok_or_else(|| {
            HostFault::new(operation(), "object is not live").with_hresult(E_FAIL as i32)
        })?;
        graph.values.insert((path, name.to_string()), value);
        Ok(())
    }

    fn invoke(
        &self,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> std::result::Result<Variant, HostFault> {
        match name {
            "Add" => {
                let operation = || format!("Invoke(Add) on {target}");
                self.enter(name, operation)?;
                let mut graph = self.graph.lock();
                let path = graph.path_of(target).ok_or_else(|| {
                    HostFault::new(operation(), "object is not live").with_hresult(E_FAIL as i32)
                })?;
                let leaf = key_of(args.first())
                    .unwrap_or_else(|| format!("Item{}", graph.children(&path).len() + 1));
                let child = child_path(&path, &leaf);
                graph.nodes.insert(child.clone());
                Ok(graph.hand_out(child))
            }
            "Delete" => {
                let operation = || format!("Invoke(Delete) on {target}");
                self.enter(name, operation)?;
                let mut graph = self.graph.lock();
                let path = graph.path_of(target).ok_or_else(|| {
                    HostFault::new(operation(), "object is not live").with_hresult(E_FAIL as i32)
                })?;
                let prefix = child_path(&path, "");
                graph.nodes.retain(|n| *n != path && !n.starts_with(&prefix));
                Ok(Variant::Null)
            }
            "Calculate" => {
                self.enter(name, || format!("Invoke(Calculate) on {target}"))?;
                Ok(Variant::Null)
            }
            _ => self.resolve("Invoke", target, name, args),
        }
    }

    fn release(&self, handle: ObjectId) -> std::result::Result<(), HostFault> {
        let mut graph = self.graph.lock();
        graph.release_calls += 1;
        if graph.fail_releases {
            return Err(HostFault::new(format!("Release {handle}"), "release rejected")
                .with_hresult(E_FAIL as i32));
        }
        graph.release_log.push(handle);
        let was_live = if handle == ROOT {
            !std::mem::replace(&mut graph.root_released, true)
        } else {
            graph.live.remove(&handle).is_some()
        };
        if !was_live {
            graph.double_releases += 1;
        }
        Ok(())
    }

    fn ping(&self) -> std::result::Result<(), HostFault> {
        self.enter("Ping", || "Ping".to_string())
    }

    fn save(&self, path: Option<&str>) -> std::result::Result<(), HostFault> {
        self.enter("Save", || "Save".to_string())?;
        self.graph.lock().saves.push(path.map(str::to_string));
        Ok(())
    }

    fn set_visible(&self, visible: bool) -> std::result::Result<(), HostFault> {
        self.enter("Visible", || "SetVisible".to_string())?;
        self.graph.lock().visible = visible;
        Ok(())
    }

    fn quit(&self) -> std::result::Result<(), HostFault> {
        self.enter("Quit", || "Quit".to_string())?;
        self.graph.lock().quit = true;
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _hangs = self.hangs.lock();
        self.hang_cv.notify_all();
    }
}

type Configure = Box<dyn Fn(&FakeHost) + Send + Sync>;

/// Launches [`FakeHost`]s and remembers them.
#[derive(Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
    hosts: Mutex<Vec<(PathBuf, Arc<FakeHost>)>>,
    fail_next: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    configure: Option<Configure>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `configure` on every host before it is handed out.
    pub fn with_setup(configure: impl Fn(&FakeHost) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            configure: Some(Box::new(configure)),
            ..Self::default()
        })
    }

    pub fn fail_next_launch(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    /// Make each launch take at least `delay`.
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Launch attempts, counting failed ones.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn hosts(&self) -> Vec<Arc<FakeHost>> {
        self.hosts.lock().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// The most recent host launched for `path`.
    pub fn host_for(&self, path: impl AsRef<Path>) -> Option<Arc<FakeHost>> {
        let wanted = crate::session::FileIdentity::new(path);
        self.hosts
            .lock()
            .iter()
            .rev()
            .find(|(p, _)| crate::session::FileIdentity::new(p) == wanted)
            .map(|(_, h)| Arc::clone(h))
    }
}

impl HostLauncher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Arc<dyn Host>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(EngineError::HostLaunchFailed {
                file: request.file.to_string(),
                reason,
            });
        }

        let host = FakeHost::new();
        if let Some(configure) = &self.configure {
            configure(&host);
        }
        host.graph.lock().visible = request.visible;
        self.hosts.lock().push((request.path(), Arc::clone(&host)));
        Ok(host)
    }
}

impl std::fmt::Debug for FakeLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeLauncher")
            .field("launches", &self.launches())
            .finish()
    }
}
