//! A simulated MicroPython board for tests.
//!
//! The board implements [`Link`] with the raw REPL framing of the real
//! interpreter and an in-memory filesystem. It only understands the statements
//! produced by the remote filesystem commands (plus `sys.stdout.write`,
//! `print` and `raise OSError` for channel tests); anything else raises a
//! `SyntaxError`.

use std::{
    cell::RefCell,
    cmp,
    collections::{BTreeMap, BTreeSet, VecDeque},
    rc::Rc,
    str::Chars,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use crate::{
    entry::parent,
    error::{Error, Result},
    local::digest,
    transport::Link,
};

const KEYBOARD_INTERRUPT: &[u8] = b"\r\nTraceback (most recent call last):\r\n  \
    File \"main.py\", line 14, in <module>\r\nKeyboardInterrupt: \r\n\r\n\
    MicroPython v1.19.1 on 2022-06-18; ESP module with ESP8266\r\n\
    Type \"help()\" for more information.\r\n>>> ";
const RAW_BANNER: &[u8] = b"\r\nraw REPL; CTRL-B to exit\r\n>";
const PROGRAM_NOISE: &[u8] = b"DEBUG temperature=21.5 humidity=40\r\n";

static BOARDS: AtomicUsize = AtomicUsize::new(0);

/// Injected misbehavior for the next executed command.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Swallow the command and never answer.
    Silence,
    /// Raise the given exception line instead of running the command.
    Raise(String),
}

#[derive(Clone)]
pub(crate) struct SimBoard {
    name: String,
    inner: Rc<RefCell<Board>>,
}
impl SimBoard {
    /// A board running a quiet program that yields to the first interrupt.
    pub fn new() -> Self {
        let id = BOARDS.fetch_add(1, Ordering::SeqCst);
        SimBoard {
            name: format!("sim{}", id),
            inner: Rc::new(RefCell::new(Board::new())),
        }
    }

    /// A board whose program prints continuously and ignores every input for
    /// `busy` from now.
    pub fn busy_for(busy: Duration) -> Self {
        let board = SimBoard::new();
        board.inner.borrow_mut().busy_until = Some(Instant::now() + busy);
        board
    }

    /// Queue bytes as if the board had printed them.
    pub fn emit(&self, bytes: &[u8]) {
        self.inner.borrow_mut().output.extend(bytes.iter().copied());
    }

    pub fn inject(&self, fault: Fault) {
        self.inject_after(0, fault);
    }

    /// Apply `fault` to the command following the next `skip` ones.
    pub fn inject_after(&self, skip: usize, fault: Fault) {
        self.inner.borrow_mut().faults.push_back((skip, fault));
    }

    pub fn add_dir(&self, path: &str) {
        self.inner.borrow_mut().dirs.insert(path.to_owned());
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.inner
            .borrow_mut()
            .files
            .insert(path.to_owned(), content.to_vec());
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.inner.borrow().dirs.contains(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.borrow().files.get(path).cloned()
    }

    /// Total bytes the filesystem can hold.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.borrow_mut().capacity = Some(capacity);
    }

    pub fn without_hashlib(&self) {
        self.inner.borrow_mut().hashlib = false;
    }

    pub fn handle_open(&self) -> bool {
        self.inner.borrow().handle.is_some()
    }

    /// Number of blocks submitted in raw mode.
    pub fn commands_executed(&self) -> usize {
        self.inner.borrow().executed
    }

    /// Number of statements that changed the filesystem.
    pub fn mutations(&self) -> usize {
        self.inner.borrow().mutations
    }

    pub fn soft_resets(&self) -> usize {
        self.inner.borrow().soft_resets
    }

    /// Pull the cable: every later read or write fails.
    pub fn unplug(&self) {
        self.inner.borrow_mut().unplugged = true;
    }

    /// Deliver output one byte every `pace`, like a slow board streaming a
    /// long result.
    pub fn set_pace(&self, pace: Duration) {
        self.inner.borrow_mut().pace = Some(pace);
    }

    /// Run `hook` once, right after the `nth` block (counting from 1) was
    /// executed and before its answer is read back.
    pub fn on_command(&self, nth: usize, hook: impl FnOnce() + 'static) {
        self.inner.borrow_mut().hooks.push((nth, Box::new(hook)));
    }
}
impl Link for SimBoard {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        let started = Instant::now();
        loop {
            {
                let mut board = self.inner.borrow_mut();
                if board.unplugged {
                    return Err(disconnected());
                }
                if board.is_busy() {
                    drop(board);
                    let pause = deadline.saturating_duration_since(Instant::now());
                    thread::sleep(cmp::min(pause, Duration::from_millis(20)));
                    return Ok(PROGRAM_NOISE.to_vec());
                }
                if let (Some(pace), false) = (board.pace, board.output.is_empty()) {
                    drop(board);
                    let due = Instant::now() + pace;
                    if due > deadline {
                        thread::sleep(deadline.saturating_duration_since(Instant::now()));
                        return Err(Error::Timeout(started.elapsed()));
                    }
                    thread::sleep(pace);
                    let mut board = self.inner.borrow_mut();
                    return Ok(board.output.pop_front().into_iter().collect());
                }
                if !board.output.is_empty() {
                    // Hand out small pieces so markers straddle reads.
                    let count = cmp::min(board.output.len(), 48);
                    return Ok(board.output.drain(..count).collect());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(now - started));
            }
            thread::sleep(cmp::min(deadline - now, Duration::from_millis(5)));
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let due = {
            let mut board = self.inner.borrow_mut();
            if board.unplugged {
                return Err(disconnected());
            }
            for &b in bytes {
                board.feed(b);
            }
            board.due_hooks()
        };
        for hook in due {
            hook();
        }
        Ok(())
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Mode {
    Running,
    Friendly,
    Raw,
}

struct Board {
    mode: Mode,
    busy_until: Option<Instant>,
    input: Vec<u8>,
    output: VecDeque<u8>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    /// Path and position of the file opened by `_f=open(...)`.
    handle: Option<(String, usize)>,
    capacity: Option<usize>,
    hashlib: bool,
    faults: VecDeque<(usize, Fault)>,
    executed: usize,
    mutations: usize,
    soft_resets: usize,
    pace: Option<Duration>,
    hooks: Vec<(usize, Box<dyn FnOnce()>)>,
    unplugged: bool,
}
impl Board {
    fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_owned());
        Board {
            mode: Mode::Running,
            busy_until: None,
            input: Vec::new(),
            output: VecDeque::new(),
            files: BTreeMap::new(),
            dirs,
            handle: None,
            capacity: None,
            hashlib: true,
            faults: VecDeque::new(),
            executed: 0,
            mutations: 0,
            soft_resets: 0,
            pace: None,
            hooks: Vec::new(),
            unplugged: false,
        }
    }

    fn due_hooks(&mut self) -> Vec<Box<dyn FnOnce()>> {
        let executed = self.executed;
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.hooks)
            .into_iter()
            .partition(|(nth, _)| *nth <= executed);
        self.hooks = pending;
        due.into_iter().map(|(_, hook)| hook).collect()
    }

    fn is_busy(&self) -> bool {
        matches!(self.busy_until, Some(until) if Instant::now() < until)
    }

    fn out(&mut self, bytes: &[u8]) {
        self.output.extend(bytes.iter().copied());
    }

    fn feed(&mut self, b: u8) {
        if self.is_busy() {
            return;
        }
        match self.mode {
            Mode::Running => {
                if b == 0x03 {
                    self.mode = Mode::Friendly;
                    self.out(KEYBOARD_INTERRUPT);
                }
            }
            Mode::Friendly => match b {
                0x01 => {
                    self.mode = Mode::Raw;
                    self.input.clear();
                    self.out(RAW_BANNER);
                }
                0x03 => self.out(b"\r\n>>> "),
                0x04 => {
                    self.mode = Mode::Running;
                    self.handle = None;
                    self.soft_resets += 1;
                    self.out(b"MPY: soft reboot\r\n");
                }
                _ => {}
            },
            Mode::Raw => match b {
                0x01 => {
                    self.input.clear();
                    self.out(RAW_BANNER);
                }
                0x02 => {
                    self.mode = Mode::Friendly;
                    self.out(b"\r\n>>> ");
                }
                0x03 => self.input.clear(),
                0x04 => self.execute_input(),
                _ => self.input.push(b),
            },
        }
    }

    fn next_fault(&mut self) -> Option<Fault> {
        let due = match self.faults.front_mut() {
            Some((0, _)) => true,
            Some((skip, _)) => {
                *skip -= 1;
                false
            }
            None => false,
        };
        if due {
            self.faults.pop_front().map(|(_, fault)| fault)
        } else {
            None
        }
    }

    fn execute_input(&mut self) {
        let script = String::from_utf8_lossy(&std::mem::take(&mut self.input)).into_owned();
        self.executed += 1;

        let (output, error) = match self.next_fault() {
            Some(Fault::Silence) => return,
            Some(Fault::Raise(exception)) => (Vec::new(), traceback(1, &exception)),
            None => self.interpret(&script),
        };
        self.out(b"OK");
        self.out(&output);
        self.out(b"\x04");
        self.out(error.as_bytes());
        self.out(b"\x04>");
    }

    fn interpret(&mut self, script: &str) -> (Vec<u8>, String) {
        let mut output = Vec::new();
        for (index, line) in script.lines().enumerate() {
            if line.is_empty() || line.starts_with(' ') {
                continue;
            }
            if let Err(exception) = self.statement(line.trim(), &mut output) {
                return (output, traceback(index + 1, &exception));
            }
        }
        (output, String::new())
    }

    fn statement(&mut self, stmt: &str, output: &mut Vec<u8>) -> std::result::Result<(), String> {
        if stmt.starts_with("import ") || stmt.starts_with("def ") {
            return Ok(());
        }
        if let Some(arg) = call(stmt, "os.mkdir(", ")") {
            let path = str_arg(arg)?;
            if self.dirs.contains(&path) || self.files.contains_key(&path) {
                return Err(errno(17));
            }
            self.require_parent(&path)?;
            self.dirs.insert(path);
            self.mutations += 1;
            return Ok(());
        }
        if let Some(arg) = call(stmt, "os.remove(", ")") {
            let path = str_arg(arg)?;
            self.files.remove(&path).ok_or_else(|| errno(2))?;
            self.mutations += 1;
            return Ok(());
        }
        if let Some(arg) = call(stmt, "os.rmdir(", ")") {
            let path = str_arg(arg)?;
            if !self.dirs.contains(&path) {
                return Err(errno(2));
            }
            if !self.children(&path).is_empty() {
                return Err(errno(13));
            }
            self.dirs.remove(&path);
            self.mutations += 1;
            return Ok(());
        }
        if let Some(arg) = call(stmt, "_f=open(", ",'wb')") {
            let path = str_arg(arg)?;
            if self.dirs.contains(&path) {
                return Err(errno(21));
            }
            self.require_parent(&path)?;
            self.files.insert(path.clone(), Vec::new());
            self.handle = Some((path, 0));
            self.mutations += 1;
            return Ok(());
        }
        if let Some(arg) = call(stmt, "_f.seek(", ")") {
            let offset = arg.parse().map_err(|_| syntax_error())?;
            let handle = self.handle.as_mut().ok_or_else(no_handle)?;
            handle.1 = offset;
            return Ok(());
        }
        if let Some(arg) = call(stmt, "_f.write(", ")") {
            let data = bytes_arg(arg)?;
            let (path, pos) = self.handle.clone().ok_or_else(no_handle)?;
            let current = self.files.get(&path).map(Vec::len).unwrap_or(0);
            let new_len = cmp::max(current, pos + data.len());
            if let Some(capacity) = self.capacity {
                let used: usize = self.files.values().map(Vec::len).sum::<usize>() - current;
                if used + new_len > capacity {
                    return Err(errno(28));
                }
            }
            let file = self.files.entry(path.clone()).or_default();
            file.resize(new_len, 0);
            file[pos..pos + data.len()].copy_from_slice(&data);
            self.handle = Some((path, pos + data.len()));
            self.mutations += 1;
            return Ok(());
        }
        if stmt == "_f.close()" {
            self.handle = None;
            return Ok(());
        }
        if let Some(arg) = call(stmt, "_ls(", ")") {
            let path = str_arg(arg)?;
            if !self.dirs.contains(&path) {
                return Err(errno(2));
            }
            self.list(&path, output);
            return Ok(());
        }
        if let Some(arg) = call(stmt, "sys.stdout.write(", ")") {
            output.extend_from_slice(str_arg(arg)?.as_bytes());
            return Ok(());
        }
        if let Some(arg) = call(stmt, "print(", ")") {
            output.extend_from_slice(str_arg(arg)?.as_bytes());
            output.extend_from_slice(b"\r\n");
            return Ok(());
        }
        if let Some(arg) = call(stmt, "raise OSError(", ")") {
            return Err(format!("OSError: {}", arg));
        }
        Err(syntax_error())
    }

    fn require_parent(&self, path: &str) -> std::result::Result<(), String> {
        match parent(path) {
            Some(dir) if self.dirs.contains(dir) => Ok(()),
            _ => Err(errno(2)),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.dirs
            .iter()
            .chain(self.files.keys())
            .filter(|p| p.as_str() != "/" && parent(p) == Some(dir))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn list(&self, dir: &str, output: &mut Vec<u8>) {
        for path in self.children(dir) {
            if self.dirs.contains(&path) {
                output.extend_from_slice(format!("D\t{}\r\n", path).as_bytes());
                self.list(&path, output);
            } else {
                let content = &self.files[&path];
                let hash = if self.hashlib {
                    digest(content)
                } else {
                    "-".to_owned()
                };
                let line = format!("F\t{}\t{}\t{}\r\n", path, content.len(), hash);
                output.extend_from_slice(line.as_bytes());
            }
        }
    }
}

fn disconnected() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "the device went away",
    ))
}

fn traceback(line: usize, exception: &str) -> String {
    format!(
        "Traceback (most recent call last):\r\n  File \"<stdin>\", line {}, in <module>\r\n{}\r\n",
        line, exception
    )
}

fn errno(code: u32) -> String {
    let name = match code {
        2 => "ENOENT",
        13 => "EACCES",
        17 => "EEXIST",
        21 => "EISDIR",
        28 => "ENOSPC",
        _ => "EIO",
    };
    format!("OSError: [Errno {}] {}", code, name)
}

fn syntax_error() -> String {
    "SyntaxError: invalid syntax".to_owned()
}

fn no_handle() -> String {
    "NameError: name '_f' isn't defined".to_owned()
}

fn call<'a>(stmt: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    stmt.strip_prefix(prefix)?.strip_suffix(suffix)
}

fn str_arg(arg: &str) -> std::result::Result<String, String> {
    let body = arg
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(syntax_error)?;
    unescape(body)?
        .into_iter()
        .map(|u| std::char::from_u32(u).ok_or_else(syntax_error))
        .collect()
}

fn bytes_arg(arg: &str) -> std::result::Result<Vec<u8>, String> {
    let body = arg
        .strip_prefix("b'")
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(syntax_error)?;
    unescape(body)?
        .into_iter()
        .map(|u| if u < 0x100 { Ok(u as u8) } else { Err(syntax_error()) })
        .collect()
}

fn unescape(body: &str) -> std::result::Result<Vec<u32>, String> {
    fn hex(chars: &mut Chars<'_>, digits: usize) -> std::result::Result<u32, String> {
        let text: String = chars.take(digits).collect();
        if text.len() != digits {
            return Err(syntax_error());
        }
        u32::from_str_radix(&text, 16).map_err(|_| syntax_error())
    }

    let mut units = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            units.push(c as u32);
            continue;
        }
        let unit = match chars.next().ok_or_else(syntax_error)? {
            '\\' => 0x5c,
            '\'' => 0x27,
            '"' => 0x22,
            'n' => 0x0a,
            'r' => 0x0d,
            't' => 0x09,
            'x' => hex(&mut chars, 2)?,
            'u' => hex(&mut chars, 4)?,
            'U' => hex(&mut chars, 8)?,
            _ => return Err(syntax_error()),
        };
        units.push(unit);
    }
    Ok(units)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn literals_decode_back() {
    use crate::remote_fs::{bytes_literal, str_literal};

    let bytes: Vec<u8> = (0..=255u8).rev().collect();
    assert_eq!(bytes_arg(&bytes_literal(&bytes)).unwrap(), bytes);
    let text = "/alarm/réveil ⏰🔔 'x' \\ \t";
    assert_eq!(str_arg(&str_literal(text)).unwrap(), text);
}
