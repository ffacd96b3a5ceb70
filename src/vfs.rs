//! Intercepting SQLite VFS.
//!
//! # Architecture
//!
//! A registered VFS (named "volatile" by convention) keeps every file in
//! memory: a database, its WAL, its rollback journal and its shared-memory
//! regions all hang off one [`DbObject`] keyed by the main file name.
//!
//! The WAL write path is where replication hooks in. Writes are stored
//! through to the in-memory WAL image, and a watermark tracks the prefix
//! that has been confirmed by the replication log. When a write completes a
//! commit frame, every frame accumulated past the watermark is handed to
//! the registered [`CommitHook`]; the calling worker stays suspended until
//! the hook returns. Success advances the watermark; failure truncates the
//! image back to it and fails the write, which SQLite turns into a
//! statement failure and rolls back.
//!
//! `apply` is the inverse path: frames that arrive from the log (on a
//! replica) are appended with a synthesised checksum chain and the shm
//! wal-index header is invalidated so the next reader re-runs recovery.
//!
//! # Page lookup and locking
//!
//! Byte-range locks on the main file are granted unconditionally: access to
//! one database is serialised by the pool's ordered classes. Shared-memory
//! locks are enforced for real, since WAL reader/writer coordination
//! depends on them.

use std::ffi::{CStr, CString};
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rusqlite::ffi;

use crate::error::{Error, RoostResult};
use crate::frames::{self, Frame, WalHeader, FRAME_HDR_SIZE, WAL_HDR_SIZE};

/// Shared-memory region size used by SQLite's wal-index.
const SHM_REGION_SIZE: usize = 32768;
/// Number of shared-memory lock slots.
const SHM_NLOCK: usize = 8;
/// Bytes of the wal-index header (two copies plus checkpoint info).
const WAL_INDEX_HDR_SIZE: usize = 136;

/// Receives the frames of one local commit before they are acknowledged.
///
/// Returning an error fails the SQLite write that carried the commit frame;
/// the transaction rolls back and the WAL image is rewound.
pub trait CommitHook: Send + Sync {
    fn commit(&self, db: &str, page_size: u32, frames: Vec<Frame>) -> RoostResult<()>;
}

/// WAL image plus capture state.
struct WalState {
    data: Vec<u8>,
    /// Page size parsed from the WAL header; zero until the header exists.
    page_size: u32,
    /// Byte length of the prefix confirmed by replication.
    committed: usize,
}

/// Outcome of a WAL write that completed a commit frame.
struct CommitEvent {
    frames: Vec<Frame>,
    end: usize,
}

impl WalState {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            page_size: 0,
            committed: 0,
        }
    }

    fn frame_size(&self) -> usize {
        FRAME_HDR_SIZE + self.page_size as usize
    }

    /// Store `bytes` at `offset`, returning a commit event when the write
    /// completes a commit frame beyond the committed watermark.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Option<CommitEvent> {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);

        if offset == 0 && bytes.len() >= WAL_HDR_SIZE {
            // Header (re)write: a fresh or restarted log.
            if let Some(hdr) = WalHeader::parse(&self.data) {
                self.page_size = hdr.page_size;
            }
            self.committed = WAL_HDR_SIZE.min(self.data.len());
            return None;
        }
        if self.page_size == 0 {
            return None;
        }
        let fsz = self.frame_size();
        if end <= self.committed.max(WAL_HDR_SIZE) || (end - WAL_HDR_SIZE) % fsz != 0 {
            return None;
        }
        let frame_start = end - fsz;
        let commit = u32::from_be_bytes(
            self.data[frame_start + 4..frame_start + 8]
                .try_into()
                .unwrap(),
        );
        if commit == 0 {
            return None;
        }
        let from = self.committed.max(WAL_HDR_SIZE);
        let frames = frames::parse_frames(&self.data, from, end, self.page_size as usize);
        Some(CommitEvent { frames, end })
    }

    /// Confirm everything up to `end` as replicated.
    fn confirm(&mut self, end: usize) {
        self.committed = end;
    }

    /// Drop everything past the committed watermark.
    fn rewind(&mut self) {
        self.data.truncate(self.committed);
    }

    fn truncate(&mut self, size: usize) {
        self.data.truncate(size);
        if self.committed > self.data.len() {
            self.committed = self.data.len();
        }
        if self.data.is_empty() {
            self.committed = 0;
        }
    }

    /// Frames of the replicated prefix.
    fn committed_frames(&self) -> Vec<Frame> {
        if self.page_size == 0 || self.committed <= WAL_HDR_SIZE {
            return Vec::new();
        }
        frames::parse_frames(
            &self.data,
            WAL_HDR_SIZE,
            self.committed,
            self.page_size as usize,
        )
    }
}

/// Shared-memory state: mapped regions plus the 8-slot lock table.
struct ShmState {
    regions: Vec<Box<[u8]>>,
    shared: [u32; SHM_NLOCK],
    exclusive: [bool; SHM_NLOCK],
}

impl ShmState {
    fn new() -> Self {
        Self {
            regions: Vec::new(),
            shared: [0; SHM_NLOCK],
            exclusive: [false; SHM_NLOCK],
        }
    }

    fn lock_shared(&mut self, held: &mut u16, slot: usize) -> bool {
        let bit = 1u16 << slot;
        if *held & bit != 0 {
            return true;
        }
        if self.exclusive[slot] {
            return false;
        }
        self.shared[slot] += 1;
        *held |= bit;
        true
    }

    fn unlock_shared(&mut self, held: &mut u16, slot: usize) {
        let bit = 1u16 << slot;
        if *held & bit != 0 {
            self.shared[slot] -= 1;
            *held &= !bit;
        }
    }

    fn lock_exclusive(&mut self, held_sh: u16, held_ex: &mut u16, slot: usize) -> bool {
        let bit = 1u16 << slot;
        if *held_ex & bit != 0 {
            return true;
        }
        let own_shared = if held_sh & bit != 0 { 1 } else { 0 };
        if self.exclusive[slot] || self.shared[slot] > own_shared {
            return false;
        }
        self.exclusive[slot] = true;
        *held_ex |= bit;
        true
    }

    fn unlock_exclusive(&mut self, held_ex: &mut u16, slot: usize) {
        let bit = 1u16 << slot;
        if *held_ex & bit != 0 {
            self.exclusive[slot] = false;
            *held_ex &= !bit;
        }
    }

    /// Zero the wal-index header so the next reader runs recovery.
    fn invalidate_header(&mut self) {
        if let Some(region) = self.regions.first_mut() {
            region[..WAL_INDEX_HDR_SIZE].fill(0);
        }
    }
}

/// One in-memory database: main file, WAL, journal, shared memory.
struct DbObject {
    name: String,
    main: Mutex<Vec<u8>>,
    journal: Mutex<Vec<u8>>,
    wal: Mutex<WalState>,
    shm: Mutex<ShmState>,
}

impl DbObject {
    fn new(name: String) -> Self {
        Self {
            name,
            main: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
            wal: Mutex::new(WalState::new()),
            shm: Mutex::new(ShmState::new()),
        }
    }
}

struct VfsInner {
    name: CString,
    files: DashMap<String, Arc<DbObject>>,
    hook: RwLock<Option<Arc<dyn CommitHook>>>,
    rng: AtomicU64,
}

impl VfsInner {
    fn next_random(&self) -> u64 {
        // xorshift over a per-vfs seed; quality is irrelevant here, SQLite
        // only salts WAL headers and temp names with it
        let mut x = self.rng.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
        x ^= x >> 30;
        x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x ^= x >> 27;
        x
    }

    fn lookup(&self, base: &str) -> Option<Arc<DbObject>> {
        self.files.get(base).map(|e| e.clone())
    }

    fn get_or_create(&self, base: &str) -> Arc<DbObject> {
        self.files
            .entry(base.to_owned())
            .or_insert_with(|| Arc::new(DbObject::new(base.to_owned())))
            .clone()
    }
}

/// Which role an open file handle plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Main,
    Wal,
    Journal,
    Ephemeral,
}

/// The C-side file handle. `base` must stay first so SQLite can treat a
/// pointer to this as a `sqlite3_file`.
#[repr(C)]
struct VfsFile {
    base: ffi::sqlite3_file,
    kind: FileKind,
    /// Owned reference to the database object; null for ephemeral files.
    db: *const DbObject,
    /// Borrowed from the registration, which lives as long as the process.
    vfs: *const VfsInner,
    /// Heap buffer backing ephemeral (temp/sub-journal) files.
    ephemeral: *mut Mutex<Vec<u8>>,
    shm_shared: u16,
    shm_exclusive: u16,
}

fn wal_suffix(name: &str) -> Option<&str> {
    name.strip_suffix("-wal")
}

fn journal_suffix(name: &str) -> Option<&str> {
    name.strip_suffix("-journal")
}

fn map_hook_error(err: &Error) -> c_int {
    match err {
        Error::NotLeader { .. } | Error::Busy => ffi::SQLITE_BUSY,
        _ => ffi::SQLITE_IOERR,
    }
}

/// A registered volatile VFS.
pub struct Vfs {
    inner: Arc<VfsInner>,
    registration: Registration,
}

struct Registration(*mut ffi::sqlite3_vfs);

// The registration pointer is only handed to SQLite's global registry and
// back; the pointed-to struct is immutable after registration.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Vfs {
    /// Register a new in-memory VFS under `name`.
    pub fn register(name: &str) -> RoostResult<Arc<Vfs>> {
        let cname =
            CString::new(name).map_err(|_| Error::Io("vfs name contains NUL".to_owned()))?;
        unsafe {
            if !ffi::sqlite3_vfs_find(cname.as_ptr()).is_null() {
                return Err(Error::Io(format!("vfs {name:?} is already registered")));
            }
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        let inner = Arc::new(VfsInner {
            name: cname,
            files: DashMap::new(),
            hook: RwLock::new(None),
            rng: AtomicU64::new(seed | 1),
        });

        let mut raw: Box<ffi::sqlite3_vfs> = Box::new(unsafe { mem::zeroed() });
        raw.iVersion = 2;
        raw.szOsFile = mem::size_of::<VfsFile>() as c_int;
        raw.mxPathname = 512;
        raw.zName = inner.name.as_ptr();
        raw.pAppData = Arc::into_raw(inner.clone()) as *mut c_void;
        raw.xOpen = Some(x_open);
        raw.xDelete = Some(x_delete);
        raw.xAccess = Some(x_access);
        raw.xFullPathname = Some(x_full_pathname);
        raw.xRandomness = Some(x_randomness);
        raw.xSleep = Some(x_sleep);
        raw.xCurrentTime = Some(x_current_time);
        raw.xGetLastError = Some(x_get_last_error);
        raw.xCurrentTimeInt64 = Some(x_current_time_int64);

        let raw = Box::into_raw(raw);
        let rc = unsafe { ffi::sqlite3_vfs_register(raw, 0) };
        if rc != ffi::SQLITE_OK {
            unsafe {
                drop(Arc::from_raw((*raw).pAppData as *const VfsInner));
                drop(Box::from_raw(raw));
            }
            return Err(Error::Io(format!("sqlite3_vfs_register failed: {rc}")));
        }
        tracing::debug!(name, "registered volatile vfs");
        Ok(Arc::new(Vfs {
            inner,
            registration: Registration(raw),
        }))
    }

    pub fn name(&self) -> &str {
        self.inner.name.to_str().unwrap_or("")
    }

    /// Install the replication commit hook. Without one, commits are
    /// confirmed locally (standalone operation).
    pub fn set_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        *self.inner.hook.write() = Some(hook);
    }

    pub fn clear_commit_hook(&self) {
        *self.inner.hook.write() = None;
    }

    /// Append committed frames to `db`'s WAL, bypassing proposal. Used when
    /// entries arrive from the replication log.
    pub fn apply(&self, db: &str, page_size: u32, entry_frames: &[Frame]) -> RoostResult<()> {
        if entry_frames.is_empty() {
            return Ok(());
        }
        let obj = self.inner.get_or_create(db);
        let mut wal = obj.wal.lock();
        if wal.data.is_empty() {
            let salt1 = self.inner.next_random() as u32;
            let salt2 = self.inner.next_random() as u32;
            let hdr = WalHeader::encode(page_size, 0, salt1, salt2);
            wal.data.extend_from_slice(&hdr);
            wal.page_size = page_size;
            wal.committed = WAL_HDR_SIZE;
        }
        let hdr = WalHeader::parse(&wal.data)
            .ok_or_else(|| Error::Io(format!("{db}: invalid WAL header")))?;
        if hdr.page_size != page_size {
            return Err(Error::Io(format!(
                "{db}: page size mismatch: wal {}, entry {page_size}",
                hdr.page_size
            )));
        }
        let little = hdr.little_endian_checksums();
        let fsz = FRAME_HDR_SIZE + page_size as usize;
        // chain from the last stored frame checksum, or the header's
        let running = if wal.data.len() > WAL_HDR_SIZE {
            let last = wal.data.len() - fsz;
            (
                u32::from_be_bytes(wal.data[last + 16..last + 20].try_into().unwrap()),
                u32::from_be_bytes(wal.data[last + 20..last + 24].try_into().unwrap()),
            )
        } else {
            hdr.checksum
        };
        let mut running = running;
        for frame in entry_frames {
            if frame.data.len() != page_size as usize {
                return Err(Error::Io(format!(
                    "{db}: frame length {} does not match page size {page_size}",
                    frame.data.len()
                )));
            }
            let (bytes, next) = frames::encode_frame(frame, hdr.salt1, hdr.salt2, little, running);
            wal.data.extend_from_slice(&bytes);
            running = next;
        }
        let end = wal.data.len();
        wal.confirm(end);
        drop(wal);
        obj.shm.lock().invalidate_header();
        tracing::trace!(db, frames = entry_frames.len(), "applied committed frames");
        Ok(())
    }

    /// Frames of the locally persisted, replication-confirmed WAL prefix.
    pub fn committed_frames(&self, db: &str) -> Vec<Frame> {
        match self.inner.lookup(db) {
            Some(obj) => obj.wal.lock().committed_frames(),
            None => Vec::new(),
        }
    }

    /// Page size of `db`'s WAL, if one exists yet.
    pub fn page_size(&self, db: &str) -> Option<u32> {
        let obj = self.inner.lookup(db)?;
        let wal = obj.wal.lock();
        if wal.page_size == 0 {
            None
        } else {
            Some(wal.page_size)
        }
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        // Unregister so the name can be reused, but leak the registration
        // itself: open connections hold raw pointers into it and consult it
        // again when they close.
        unsafe {
            ffi::sqlite3_vfs_unregister(self.registration.0);
        }
    }
}

// ---------------------------------------------------------------------------
// io methods
// ---------------------------------------------------------------------------

fn io_methods() -> *const ffi::sqlite3_io_methods {
    static METHODS: OnceLock<usize> = OnceLock::new();
    *METHODS.get_or_init(|| {
        let mut m: Box<ffi::sqlite3_io_methods> = Box::new(unsafe { mem::zeroed() });
        m.iVersion = 2;
        m.xClose = Some(x_close);
        m.xRead = Some(x_read);
        m.xWrite = Some(x_write);
        m.xTruncate = Some(x_truncate);
        m.xSync = Some(x_sync);
        m.xFileSize = Some(x_file_size);
        m.xLock = Some(x_lock);
        m.xUnlock = Some(x_unlock);
        m.xCheckReservedLock = Some(x_check_reserved_lock);
        m.xFileControl = Some(x_file_control);
        m.xSectorSize = Some(x_sector_size);
        m.xDeviceCharacteristics = Some(x_device_characteristics);
        m.xShmMap = Some(x_shm_map);
        m.xShmLock = Some(x_shm_lock);
        m.xShmBarrier = Some(x_shm_barrier);
        m.xShmUnmap = Some(x_shm_unmap);
        Box::into_raw(m) as usize
    }) as *const ffi::sqlite3_io_methods
}

unsafe fn file_mut<'a>(file: *mut ffi::sqlite3_file) -> &'a mut VfsFile {
    &mut *(file as *mut VfsFile)
}

unsafe fn file_db<'a>(f: &VfsFile) -> &'a DbObject {
    &*f.db
}

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    let f = file_mut(file);
    if !f.db.is_null() {
        // release any shm locks this handle still holds
        let db = file_db(f);
        let mut shm = db.shm.lock();
        for slot in 0..SHM_NLOCK {
            shm.unlock_shared(&mut f.shm_shared, slot);
            shm.unlock_exclusive(&mut f.shm_exclusive, slot);
        }
        drop(shm);
        drop(Arc::from_raw(f.db));
        f.db = ptr::null();
    }
    if !f.ephemeral.is_null() {
        drop(Box::from_raw(f.ephemeral));
        f.ephemeral = ptr::null_mut();
    }
    f.base.pMethods = ptr::null();
    ffi::SQLITE_OK
}

unsafe fn read_from(data: &[u8], buf: *mut c_void, amt: c_int, offset: i64) -> c_int {
    let amt = amt as usize;
    let offset = offset as usize;
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt);
    if offset >= data.len() {
        out.fill(0);
        return ffi::SQLITE_IOERR_SHORT_READ;
    }
    let available = data.len() - offset;
    if available < amt {
        out[..available].copy_from_slice(&data[offset..]);
        out[available..].fill(0);
        return ffi::SQLITE_IOERR_SHORT_READ;
    }
    out.copy_from_slice(&data[offset..offset + amt]);
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let f = file_mut(file);
    match f.kind {
        FileKind::Main => read_from(&file_db(f).main.lock(), buf, amt, offset),
        FileKind::Wal => read_from(&file_db(f).wal.lock().data, buf, amt, offset),
        FileKind::Journal => read_from(&file_db(f).journal.lock(), buf, amt, offset),
        FileKind::Ephemeral => read_from(&(*f.ephemeral).lock(), buf, amt, offset),
    }
}

fn write_into(data: &mut Vec<u8>, bytes: &[u8], offset: usize) {
    let end = offset + bytes.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[offset..end].copy_from_slice(bytes);
}

unsafe extern "C" fn x_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let f = file_mut(file);
    let bytes = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    let offset = offset as usize;
    match f.kind {
        FileKind::Main => {
            write_into(&mut file_db(f).main.lock(), bytes, offset);
            ffi::SQLITE_OK
        }
        FileKind::Journal => {
            write_into(&mut file_db(f).journal.lock(), bytes, offset);
            ffi::SQLITE_OK
        }
        FileKind::Ephemeral => {
            write_into(&mut (*f.ephemeral).lock(), bytes, offset);
            ffi::SQLITE_OK
        }
        FileKind::Wal => {
            let db = file_db(f);
            let mut wal = db.wal.lock();
            let Some(event) = wal.write(offset, bytes) else {
                return ffi::SQLITE_OK;
            };
            // a commit frame just landed: hand the transaction's frames to
            // replication and suspend this worker until it resolves
            let hook = (*f.vfs).hook.read().clone();
            let Some(hook) = hook else {
                wal.confirm(event.end);
                return ffi::SQLITE_OK;
            };
            let page_size = wal.page_size;
            match hook.commit(&db.name, page_size, event.frames) {
                Ok(()) => {
                    wal.confirm(event.end);
                    ffi::SQLITE_OK
                }
                Err(err) => {
                    tracing::debug!(db = %db.name, %err, "commit rejected by replication");
                    wal.rewind();
                    map_hook_error(&err)
                }
            }
        }
    }
}

unsafe extern "C" fn x_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    let f = file_mut(file);
    let size = size as usize;
    match f.kind {
        FileKind::Main => file_db(f).main.lock().truncate(size),
        FileKind::Journal => file_db(f).journal.lock().truncate(size),
        FileKind::Ephemeral => (*f.ephemeral).lock().truncate(size),
        FileKind::Wal => file_db(f).wal.lock().truncate(size),
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_sync(_file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_size(
    file: *mut ffi::sqlite3_file,
    out: *mut ffi::sqlite3_int64,
) -> c_int {
    let f = file_mut(file);
    let len = match f.kind {
        FileKind::Main => file_db(f).main.lock().len(),
        FileKind::Journal => file_db(f).journal.lock().len(),
        FileKind::Ephemeral => (*f.ephemeral).lock().len(),
        FileKind::Wal => file_db(f).wal.lock().data.len(),
    };
    *out = len as ffi::sqlite3_int64;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_lock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_unlock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_check_reserved_lock(
    _file: *mut ffi::sqlite3_file,
    out: *mut c_int,
) -> c_int {
    *out = 0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_control(
    _file: *mut ffi::sqlite3_file,
    _op: c_int,
    _arg: *mut c_void,
) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn x_sector_size(_file: *mut ffi::sqlite3_file) -> c_int {
    512
}

unsafe extern "C" fn x_device_characteristics(_file: *mut ffi::sqlite3_file) -> c_int {
    0
}

unsafe extern "C" fn x_shm_map(
    file: *mut ffi::sqlite3_file,
    region: c_int,
    size: c_int,
    extend: c_int,
    out: *mut *mut c_void,
) -> c_int {
    let f = file_mut(file);
    if f.db.is_null() {
        return ffi::SQLITE_IOERR;
    }
    let db = file_db(f);
    let mut shm = db.shm.lock();
    let region = region as usize;
    if region >= shm.regions.len() {
        if extend == 0 {
            *out = ptr::null_mut();
            return ffi::SQLITE_OK;
        }
        while shm.regions.len() <= region {
            shm.regions
                .push(vec![0u8; size.max(SHM_REGION_SIZE as c_int) as usize].into_boxed_slice());
        }
    }
    *out = shm.regions[region].as_mut_ptr() as *mut c_void;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_shm_lock(
    file: *mut ffi::sqlite3_file,
    offset: c_int,
    n: c_int,
    flags: c_int,
) -> c_int {
    let f = file_mut(file);
    if f.db.is_null() {
        return ffi::SQLITE_IOERR;
    }
    let db = file_db(f);
    let mut shm = db.shm.lock();
    let offset = offset as usize;
    let n = n as usize;
    if offset + n > SHM_NLOCK {
        return ffi::SQLITE_MISUSE;
    }
    let shared = flags & ffi::SQLITE_SHM_SHARED != 0;
    if flags & ffi::SQLITE_SHM_UNLOCK != 0 {
        for slot in offset..offset + n {
            if shared {
                shm.unlock_shared(&mut f.shm_shared, slot);
            } else {
                shm.unlock_exclusive(&mut f.shm_exclusive, slot);
            }
        }
        return ffi::SQLITE_OK;
    }
    // acquire: check the whole range first so the operation is all-or-nothing
    for slot in offset..offset + n {
        let bit = 1u16 << slot;
        let ok = if shared {
            f.shm_shared & bit != 0 || !shm.exclusive[slot]
        } else {
            let own_shared = if f.shm_shared & bit != 0 { 1 } else { 0 };
            f.shm_exclusive & bit != 0
                || (!shm.exclusive[slot] && shm.shared[slot] <= own_shared)
        };
        if !ok {
            return ffi::SQLITE_BUSY;
        }
    }
    for slot in offset..offset + n {
        if shared {
            shm.lock_shared(&mut f.shm_shared, slot);
        } else {
            shm.lock_exclusive(f.shm_shared, &mut f.shm_exclusive, slot);
        }
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_shm_barrier(_file: *mut ffi::sqlite3_file) {
    std::sync::atomic::fence(Ordering::SeqCst);
}

unsafe extern "C" fn x_shm_unmap(file: *mut ffi::sqlite3_file, _delete: c_int) -> c_int {
    let f = file_mut(file);
    if !f.db.is_null() {
        let db = file_db(f);
        let mut shm = db.shm.lock();
        for slot in 0..SHM_NLOCK {
            shm.unlock_shared(&mut f.shm_shared, slot);
            shm.unlock_exclusive(&mut f.shm_exclusive, slot);
        }
    }
    ffi::SQLITE_OK
}

// ---------------------------------------------------------------------------
// vfs methods
// ---------------------------------------------------------------------------

unsafe fn vfs_inner<'a>(vfs: *mut ffi::sqlite3_vfs) -> &'a VfsInner {
    &*((*vfs).pAppData as *const VfsInner)
}

unsafe extern "C" fn x_open(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    let inner = vfs_inner(vfs);
    let f = file_mut(file);
    f.base.pMethods = ptr::null();
    f.db = ptr::null();
    f.vfs = inner as *const VfsInner;
    f.ephemeral = ptr::null_mut();
    f.shm_shared = 0;
    f.shm_exclusive = 0;

    let fname = if name.is_null() {
        None
    } else {
        match CStr::from_ptr(name).to_str() {
            Ok(s) => Some(s.to_owned()),
            Err(_) => return ffi::SQLITE_CANTOPEN,
        }
    };

    let kind = if flags & ffi::SQLITE_OPEN_MAIN_DB != 0 {
        FileKind::Main
    } else if flags & ffi::SQLITE_OPEN_WAL != 0 {
        FileKind::Wal
    } else if flags & ffi::SQLITE_OPEN_MAIN_JOURNAL != 0 {
        FileKind::Journal
    } else {
        FileKind::Ephemeral
    };

    match kind {
        FileKind::Main => {
            let Some(fname) = fname else {
                return ffi::SQLITE_CANTOPEN;
            };
            if inner.lookup(&fname).is_none() && flags & ffi::SQLITE_OPEN_CREATE == 0 {
                return ffi::SQLITE_CANTOPEN;
            }
            let obj = inner.get_or_create(&fname);
            f.db = Arc::into_raw(obj);
        }
        FileKind::Wal => {
            let Some(base) = fname.as_deref().and_then(wal_suffix) else {
                return ffi::SQLITE_CANTOPEN;
            };
            let obj = inner.get_or_create(base);
            f.db = Arc::into_raw(obj);
        }
        FileKind::Journal => {
            let Some(base) = fname.as_deref().and_then(journal_suffix) else {
                return ffi::SQLITE_CANTOPEN;
            };
            let obj = inner.get_or_create(base);
            f.db = Arc::into_raw(obj);
        }
        FileKind::Ephemeral => {
            f.ephemeral = Box::into_raw(Box::new(Mutex::new(Vec::new())));
        }
    }

    f.kind = kind;
    f.base.pMethods = io_methods();
    if !out_flags.is_null() {
        *out_flags = flags;
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_delete(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let inner = vfs_inner(vfs);
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return ffi::SQLITE_IOERR_DELETE;
    };
    if let Some(base) = wal_suffix(name) {
        if let Some(obj) = inner.lookup(base) {
            let mut wal = obj.wal.lock();
            wal.data.clear();
            wal.committed = 0;
        }
    } else if let Some(base) = journal_suffix(name) {
        if let Some(obj) = inner.lookup(base) {
            obj.journal.lock().clear();
        }
    } else {
        inner.files.remove(name);
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_access(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    _flags: c_int,
    out: *mut c_int,
) -> c_int {
    let inner = vfs_inner(vfs);
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        *out = 0;
        return ffi::SQLITE_OK;
    };
    let exists = if let Some(base) = wal_suffix(name) {
        inner
            .lookup(base)
            .map(|o| !o.wal.lock().data.is_empty())
            .unwrap_or(false)
    } else if let Some(base) = journal_suffix(name) {
        inner
            .lookup(base)
            .map(|o| !o.journal.lock().is_empty())
            .unwrap_or(false)
    } else {
        inner.files.contains_key(name)
    };
    *out = exists as c_int;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    n_out: c_int,
    out: *mut c_char,
) -> c_int {
    let src = CStr::from_ptr(name);
    let bytes = src.to_bytes_with_nul();
    if bytes.len() > n_out as usize {
        return ffi::SQLITE_CANTOPEN;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    out: *mut c_char,
) -> c_int {
    let inner = vfs_inner(vfs);
    let out = std::slice::from_raw_parts_mut(out as *mut u8, n_byte as usize);
    for chunk in out.chunks_mut(8) {
        let r = inner.next_random().to_le_bytes();
        chunk.copy_from_slice(&r[..chunk.len()]);
    }
    n_byte
}

unsafe extern "C" fn x_sleep(_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
    microseconds
}

const JULIAN_UNIX_EPOCH_MILLIS: i64 = 210_866_760_000_000;

unsafe extern "C" fn x_current_time(vfs: *mut ffi::sqlite3_vfs, out: *mut f64) -> c_int {
    let mut millis: ffi::sqlite3_int64 = 0;
    x_current_time_int64(vfs, &mut millis);
    *out = millis as f64 / 86_400_000.0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_get_last_error(
    _vfs: *mut ffi::sqlite3_vfs,
    _n: c_int,
    _out: *mut c_char,
) -> c_int {
    0
}

unsafe extern "C" fn x_current_time_int64(
    _vfs: *mut ffi::sqlite3_vfs,
    out: *mut ffi::sqlite3_int64,
) -> c_int {
    let unix_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    *out = JULIAN_UNIX_EPOCH_MILLIS + unix_millis;
    ffi::SQLITE_OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::WAL_MAGIC_LE;
    use byteorder::{BigEndian, ByteOrder};

    fn header_bytes(page_size: u32) -> Vec<u8> {
        WalHeader::encode(page_size, 0, 7, 9).to_vec()
    }

    fn frame_bytes(page_number: u32, commit: u32, page_size: usize, fill: u8) -> Vec<u8> {
        let mut buf = vec![0u8; FRAME_HDR_SIZE + page_size];
        BigEndian::write_u32(&mut buf[0..4], page_number);
        BigEndian::write_u32(&mut buf[4..8], commit);
        buf[FRAME_HDR_SIZE..].fill(fill);
        buf
    }

    #[test]
    fn capture_detects_commit_frames() {
        let mut wal = WalState::new();
        assert!(wal.write(0, &header_bytes(512)).is_none());
        assert_eq!(wal.page_size, 512);
        assert_eq!(wal.committed, WAL_HDR_SIZE);

        let f1 = frame_bytes(1, 0, 512, 0xaa);
        let f2 = frame_bytes(2, 2, 512, 0xbb);
        // header then page, two writes per frame, like SQLite issues them
        assert!(wal.write(WAL_HDR_SIZE, &f1[..FRAME_HDR_SIZE]).is_none());
        assert!(wal
            .write(WAL_HDR_SIZE + FRAME_HDR_SIZE, &f1[FRAME_HDR_SIZE..])
            .is_none());
        let second = WAL_HDR_SIZE + f1.len();
        assert!(wal.write(second, &f2[..FRAME_HDR_SIZE]).is_none());
        let event = wal
            .write(second + FRAME_HDR_SIZE, &f2[FRAME_HDR_SIZE..])
            .expect("commit frame completes a transaction");
        assert_eq!(event.frames.len(), 2);
        assert_eq!(event.frames[0].page_number, 1);
        assert_eq!(event.frames[1].page_number, 2);
        assert!(event.frames[1].is_commit());

        wal.confirm(event.end);
        assert_eq!(wal.committed_frames().len(), 2);
    }

    #[test]
    fn rewind_drops_unconfirmed_frames() {
        let mut wal = WalState::new();
        wal.write(0, &header_bytes(512));
        let f = frame_bytes(1, 1, 512, 0x11);
        let event = wal.write(WAL_HDR_SIZE, &f).unwrap();
        assert_eq!(event.frames.len(), 1);
        wal.rewind();
        assert_eq!(wal.data.len(), WAL_HDR_SIZE);
        assert!(wal.committed_frames().is_empty());
    }

    #[test]
    fn header_rewrite_resets_capture() {
        let mut wal = WalState::new();
        wal.write(0, &header_bytes(512));
        let f = frame_bytes(1, 1, 512, 0x11);
        let event = wal.write(WAL_HDR_SIZE, &f).unwrap();
        wal.confirm(event.end);
        // log restart: new header over the old image
        wal.write(0, &header_bytes(512));
        assert_eq!(wal.committed, WAL_HDR_SIZE);
    }

    #[test]
    fn shm_lock_table_semantics() {
        let mut shm = ShmState::new();
        let mut a_sh = 0u16;
        let mut a_ex = 0u16;
        let mut b_sh = 0u16;
        let mut b_ex = 0u16;

        assert!(shm.lock_shared(&mut a_sh, 0));
        assert!(shm.lock_shared(&mut b_sh, 0));
        // exclusive blocked by the other holder's share
        assert!(!shm.lock_exclusive(a_sh, &mut a_ex, 0));
        shm.unlock_shared(&mut b_sh, 0);
        // own share does not block upgrading
        assert!(shm.lock_exclusive(a_sh, &mut a_ex, 0));
        assert!(!shm.lock_shared(&mut b_sh, 0));
        shm.unlock_exclusive(&mut a_ex, 0);
        assert!(shm.lock_shared(&mut b_sh, 0));
    }

    #[test]
    fn apply_builds_a_valid_checksum_chain() {
        let vfs = Vfs::register("volatile-apply-test").unwrap();
        let frames_in = vec![
            Frame {
                page_number: 1,
                commit: 0,
                data: vec![0x55; 512],
            },
            Frame {
                page_number: 2,
                commit: 2,
                data: vec![0x66; 512],
            },
        ];
        vfs.apply("a.db", 512, &frames_in).unwrap();
        let obj = vfs.inner.lookup("a.db").unwrap();
        let wal = obj.wal.lock();
        let hdr = WalHeader::parse(&wal.data).unwrap();
        assert_eq!(hdr.magic, WAL_MAGIC_LE);
        assert_eq!(hdr.page_size, 512);
        // header checksum covers its first 24 bytes
        assert_eq!(hdr.checksum, frames::checksum(true, (0, 0), &wal.data[..24]));
        // each frame's stored checksum continues the chain
        let fsz = FRAME_HDR_SIZE + 512;
        let mut running = hdr.checksum;
        for i in 0..2 {
            let off = WAL_HDR_SIZE + i * fsz;
            running = frames::checksum(true, running, &wal.data[off..off + 8]);
            running = frames::checksum(
                true,
                running,
                &wal.data[off + FRAME_HDR_SIZE..off + fsz],
            );
            let stored = (
                BigEndian::read_u32(&wal.data[off + 16..off + 20]),
                BigEndian::read_u32(&wal.data[off + 20..off + 24]),
            );
            assert_eq!(stored, running);
        }
        drop(wal);
        assert_eq!(vfs.committed_frames("a.db"), frames_in);
    }

    #[test]
    fn apply_chains_across_calls() {
        let vfs = Vfs::register("volatile-chain-test").unwrap();
        let one = vec![Frame {
            page_number: 1,
            commit: 1,
            data: vec![1; 512],
        }];
        let two = vec![Frame {
            page_number: 1,
            commit: 1,
            data: vec![2; 512],
        }];
        vfs.apply("b.db", 512, &one).unwrap();
        vfs.apply("b.db", 512, &two).unwrap();
        let committed = vfs.committed_frames("b.db");
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[1].data, vec![2; 512]);
    }

    #[test]
    fn apply_of_nothing_is_a_noop() {
        let vfs = Vfs::register("volatile-noop-test").unwrap();
        vfs.apply("c.db", 4096, &[]).unwrap();
        assert!(vfs.committed_frames("c.db").is_empty());
        assert!(vfs.page_size("c.db").is_none());
    }
}
