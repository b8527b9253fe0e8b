//! Command buffers understood by the MicroPython interpreter.
//!
//! Each function returns the text of one raw mode command. Paths and payloads
//! always go through [`literal`](super::literal), which keeps the buffers free
//! of control bytes.

use super::literal::{bytes_literal, str_literal};

/// Name of the global holding the open file handle between commands.
const HANDLE: &str = "_f";

pub(crate) fn mkdir(path: &str) -> String {
    format!("import os\nos.mkdir({})\n", str_literal(path))
}

pub(crate) fn remove_file(path: &str) -> String {
    format!("import os\nos.remove({})\n", str_literal(path))
}

pub(crate) fn remove_dir(path: &str) -> String {
    format!("import os\nos.rmdir({})\n", str_literal(path))
}

/// Create or truncate `path` and keep the handle open for [`write_at`].
pub(crate) fn open_for_write(path: &str) -> String {
    format!("{}=open({},'wb')\n", HANDLE, str_literal(path))
}

/// Write `chunk` at `offset`. Seeking first makes a repeated chunk overwrite
/// itself instead of appending a second copy.
pub(crate) fn write_at(offset: usize, chunk: &[u8]) -> String {
    format!(
        "{h}.seek({})\n{h}.write({})\n",
        offset,
        bytes_literal(chunk),
        h = HANDLE
    )
}

pub(crate) fn close_handle() -> String {
    format!("{}.close()\n", HANDLE)
}

/// Recursive listing of `path`, one line per entry, tab separated:
///
/// ```text
/// D   <path>
/// F   <path>  <size>  <sha256 hex, or '-' without hashlib>
/// ```
///
/// Raises `ENOENT` when `path` does not exist.
pub(crate) fn list(path: &str) -> String {
    format!("{}_ls({})\n", LIST_HELPER, str_literal(path))
}

const LIST_HELPER: &str = "\
import os
def _ls(d):
 try:
  import hashlib,binascii
 except ImportError:
  hashlib=None
 def _h(p):
  if hashlib is None:
   return '-'
  h=hashlib.sha256()
  b=bytearray(256)
  with open(p,'rb') as f:
   while True:
    n=f.readinto(b)
    if not n:
     break
    h.update(b[:n])
  return binascii.hexlify(h.digest()).decode()
 def _w(d):
  for e in os.ilistdir(d):
   p=(d if d!='/' else '')+'/'+e[0]
   if e[1]&0x4000:
    print('D',p,sep='\\t')
    _w(p)
   else:
    print('F',p,os.stat(p)[6],_h(p),sep='\\t')
 os.stat(d)
 _w(d)
";

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn simple_commands() {
    assert_eq!(mkdir("/alarm"), "import os\nos.mkdir('/alarm')\n");
    assert_eq!(remove_file("/x.py"), "import os\nos.remove('/x.py')\n");
    assert_eq!(remove_dir("/alarm"), "import os\nos.rmdir('/alarm')\n");
    assert_eq!(open_for_write("/main.py"), "_f=open('/main.py','wb')\n");
    assert_eq!(close_handle(), "_f.close()\n");
}

#[test]
fn chunk_is_keyed_by_offset() {
    assert_eq!(
        write_at(512, b"\x00ok\n"),
        "_f.seek(512)\n_f.write(b'\\x00ok\\x0a')\n"
    );
}

#[test]
fn listing_ends_with_the_call() {
    let script = list("/lib");
    assert!(script.starts_with("import os\ndef _ls(d):\n"));
    assert!(script.ends_with("\n_ls('/lib')\n"));
    assert!(script.bytes().all(|b| b == b'\n' || (0x20..=0x7e).contains(&b)));
}
