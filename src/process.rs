use crate::error::SpawnError;
use crate::launch::LaunchSpec;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, warn};

/// 诊断输出的广播缓冲行数
const LINE_BUFFER: usize = 256;
/// 没有换行符时单行的最大字节数
const MAX_LINE: usize = 4096;

/// 子进程退出结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// 启动编码进程的接缝，测试中可替换
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError>;
}

/// 直接按 LaunchSpec 创建操作系统进程
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        ProcessHandle::spawn(spec)
    }
}

/// 单个编码子进程的句柄
///
/// 子进程本身由后台任务持有，句柄之间共享退出状态、诊断输出和强杀通知。
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Shared>,
}

struct Shared {
    pid: Option<u32>,
    program: String,
    exit: watch::Receiver<Option<ExitOutcome>>,
    output_seen: watch::Receiver<bool>,
    lines: broadcast::Sender<String>,
    term: Arc<Notify>,
    kill: Arc<Notify>,
    observed: AtomicBool,
}

impl ProcessHandle {
    /// 启动子进程
    ///
    /// # 副作用
    /// - 创建子进程，stdout 丢弃，stderr 作为诊断输出
    /// - 启动后台任务读取 stderr、等待进程退出
    ///
    /// # 错误处理
    /// - 找不到可执行文件返回 `SpawnError::NotFound`
    /// - 其他系统错误返回 `SpawnError::Os`
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(spec.env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", spec.program, e);
            SpawnError::from_io(&spec.program, e)
        })?;
        let pid = child.id();
        debug!(pid = ?pid, "Spawned {}", spec.program);

        let (lines_tx, _) = broadcast::channel(LINE_BUFFER);
        let (seen_tx, seen_rx) = watch::channel(false);
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, lines_tx.clone(), seen_tx));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let term = Arc::new(Notify::new());
        let kill = Arc::new(Notify::new());
        tokio::spawn(reap(
            child,
            exit_tx,
            term.clone(),
            kill.clone(),
            spec.program.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Shared {
                pid,
                program: spec.program.clone(),
                exit: exit_rx,
                output_seen: seen_rx,
                lines: lines_tx,
                term,
                kill,
                observed: AtomicBool::new(false),
            }),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// 非阻塞的存活检查
    pub fn is_alive(&self) -> bool {
        self.inner.exit.borrow().is_none()
    }

    /// 等待进程退出
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.inner.exit.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or_default(),
            Err(_) => ExitOutcome::default(),
        };
        outcome
    }

    /// 等到第一行诊断输出；stderr 在输出前关闭则返回 false
    pub async fn first_output(&self) -> bool {
        let mut rx = self.inner.output_seen.clone();
        let seen = rx.wait_for(|seen| *seen).await.is_ok();
        seen
    }

    /// 订阅诊断输出，只能看到订阅之后的行
    pub fn diagnostic_lines(&self) -> DiagnosticLines {
        DiagnosticLines {
            rx: self.inner.lines.subscribe(),
        }
    }

    /// 先发送 SIGTERM，宽限期内未退出则强杀。对已退出的进程无操作。
    pub async fn terminate(&self, grace: Duration) -> ExitOutcome {
        if !self.is_alive() {
            return self.wait().await;
        }

        self.inner.term.notify_one();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    pid = ?self.inner.pid,
                    "{} ignored SIGTERM for {:?}, killing",
                    self.inner.program,
                    grace
                );
                self.inner.kill.notify_one();
                self.wait().await
            }
        }
    }

    /// 注册唯一的退出观察者，进程因任何原因退出后异步调用一次。
    /// 已注册过则返回 false，新的观察者被丢弃。
    pub fn on_exit<F>(&self, observer: F) -> bool
    where
        F: FnOnce(ExitOutcome) + Send + 'static,
    {
        if self.inner.observed.swap(true, Ordering::SeqCst) {
            warn!(pid = ?self.inner.pid, "Exit observer already registered");
            return false;
        }

        let handle = self.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            observer(outcome);
        });
        true
    }

}

/// 一次订阅得到的诊断输出流
pub struct DiagnosticLines {
    rx: broadcast::Receiver<String>,
}

impl DiagnosticLines {
    /// 下一行输出；所有发送端关闭后返回 None
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(line) => return Some(line),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Diagnostic subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// 读取 stderr 并按行广播。FFmpeg 的进度行以 '\r' 结尾，'\r' 和 '\n' 都切分。
async fn pump_output<R>(
    stderr: R,
    lines: broadcast::Sender<String>,
    seen: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut pending = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Diagnostic stream closed: {}", e);
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }

        let consumed = chunk.len();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                emit_line(&mut pending, &lines, &seen);
            } else {
                pending.push(byte);
                if pending.len() >= MAX_LINE {
                    emit_line(&mut pending, &lines, &seen);
                }
            }
        }
        reader.consume(consumed);
    }
    // EOF 前最后一段没有换行符
    emit_line(&mut pending, &lines, &seen);
}

fn emit_line(pending: &mut Vec<u8>, lines: &broadcast::Sender<String>, seen: &watch::Sender<bool>) {
    let text = String::from_utf8_lossy(pending);
    let line = text.trim();
    if !line.is_empty() {
        seen.send_replace(true);
        // 没有订阅者时发送失败，忽略
        let _ = lines.send(line.to_string());
    }
    pending.clear();
}

/// 持有子进程直到退出。信号只在这里发送，此时子进程尚未被回收。
async fn reap(
    mut child: Child,
    exit: watch::Sender<Option<ExitOutcome>>,
    term: Arc<Notify>,
    kill: Arc<Notify>,
    program: String,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = term.notified() => send_terminate(&mut child, &program),
            _ = kill.notified() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill {}: {}", program, e);
                }
                break child.wait().await;
            }
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status),
        Err(e) => {
            error!("Failed to wait on {}: {}", program, e);
            ExitOutcome::default()
        }
    };
    exit.send_replace(Some(outcome));
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, program: &str) {
    // 已回收的子进程 id() 返回 None
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) 只读取参数；child 仍由本任务持有且未被 wait 回收，pid 不会被复用
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM to {} failed: {}", program, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, program: &str) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill {}: {}", program, e);
    }
}
