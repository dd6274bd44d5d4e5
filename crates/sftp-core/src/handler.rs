//! SFTP Operation Handler — implements `russh_sftp::server::Handler`,
//! translating wire requests into Path Jail + Metered File Handle calls
//! (spec §4.5).
//!
//! `russh_sftp` owns packet framing; this module owns verb semantics. One
//! `SftpHandler` is constructed per SFTP subsystem channel and driven by
//! `russh_sftp::server::run` (see `crate::session`).

use std::collections::HashMap;
use std::path::PathBuf;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::jail;
use crate::metered::{AccessMode, MeteredFileHandle, SharedCounters};

/// Maps SFTP open flags onto an [`AccessMode`] (spec §6 open-flag table).
fn access_mode_for(flags: &OpenFlags) -> AccessMode {
    let read = flags.contains(OpenFlags::READ);
    let write = flags.contains(OpenFlags::WRITE);
    let append = flags.contains(OpenFlags::APPEND);

    match (read, write, append) {
        (true, false, _) => AccessMode::ReadOnly,
        (false, true, true) => AccessMode::WriteAppend,
        (false, true, false) => AccessMode::WriteTruncate,
        (true, true, true) => AccessMode::ReadWriteAppend,
        (true, true, false) => AccessMode::ReadWrite,
        (false, false, _) => AccessMode::ReadOnly,
    }
}

/// Maps a [`CoreError`] onto the status code a given verb must return
/// (spec §4.5 table: `open` returns `PERMISSION_DENIED` for IO errors
/// other verbs map to `FAILURE`).
fn status_for(err: &CoreError, is_open: bool) -> StatusCode {
    match err {
        CoreError::PathEscape(_) => StatusCode::PermissionDenied,
        CoreError::NotFound(_) => StatusCode::NoSuchFile,
        CoreError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
            std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            _ if is_open => StatusCode::PermissionDenied,
            _ => StatusCode::Failure,
        },
        _ => StatusCode::Failure,
    }
}

fn status(id: u32, code: StatusCode, message: &str) -> Status {
    Status {
        id,
        status_code: code,
        error_message: message.to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn ok_status(id: u32) -> Status {
    status(id, StatusCode::Ok, "Ok")
}

fn metadata_to_attrs(meta: &std::fs::Metadata) -> FileAttributes {
    let mut attrs = FileAttributes::default();
    attrs.size = Some(meta.len());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        attrs.permissions = Some(meta.permissions().mode());
    }
    if let Ok(modified) = meta.modified() {
        if let Ok(d) = modified.duration_since(std::time::UNIX_EPOCH) {
            attrs.mtime = Some(d.as_secs() as u32);
        }
    }
    if let Ok(accessed) = meta.accessed() {
        if let Ok(d) = accessed.duration_since(std::time::UNIX_EPOCH) {
            attrs.atime = Some(d.as_secs() as u32);
        }
    }
    attrs
}

fn long_name(filename: &str, meta: &std::fs::Metadata) -> String {
    let kind = if meta.is_dir() { 'd' } else { '-' };
    format!("{kind}rwxr-xr-x 1 user group {:>10} {filename}", meta.len())
}

struct OpenFile {
    handle: MeteredFileHandle,
}

struct OpenDir {
    entries: Vec<(String, PathBuf)>,
    offset: usize,
}

/// Per-channel SFTP verb handler. Owns the open file/directory handle
/// tables; `home`/`jail` state is fixed for the lifetime of the session.
pub struct SftpHandler {
    home: PathBuf,
    connection_id: Uuid,
    username: String,
    counters: SharedCounters,
    files: HashMap<String, OpenFile>,
    dirs: HashMap<String, OpenDir>,
    next_handle: u64,
}

impl SftpHandler {
    pub fn new(home: PathBuf, connection_id: Uuid, username: String, counters: SharedCounters) -> Self {
        Self {
            home,
            connection_id,
            username,
            counters,
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_handle: 0,
        }
    }

    fn resolve(&self, virtual_path: &str) -> Result<PathBuf, CoreError> {
        jail::resolve(virtual_path, &self.home)
    }

    fn next_handle_id(&mut self) -> String {
        self.next_handle += 1;
        format!("h{}", self.next_handle)
    }
}

#[async_trait::async_trait]
impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "sftp init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let host_path = match self.resolve(&filename) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %filename, error = %e, "open: jail rejected path");
                return Err(status_for(&e, true));
            }
        };

        let mode = access_mode_for(&pflags);
        let create = pflags.contains(OpenFlags::CREATE);
        let truncate = pflags.contains(OpenFlags::TRUNCATE);
        let append = pflags.contains(OpenFlags::APPEND);
        let exclusive = pflags.contains(OpenFlags::EXCLUDE);

        if create {
            if let Some(parent) = host_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Err(status_for(&CoreError::Io(e), true));
                }
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .read(mode.meters_reads())
            .write(mode.meters_writes())
            .create(create)
            .create_new(create && exclusive)
            .truncate(create && truncate)
            .append(append)
            .open(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), true))?;

        // attrs.mode is honored on create, never on an existing file.
        #[cfg(unix)]
        if create {
            if let Some(mode_bits) = attrs.permissions {
                use std::os::unix::fs::PermissionsExt;
                let _ = file
                    .set_permissions(std::fs::Permissions::from_mode(mode_bits))
                    .await;
            }
        }

        let canonical_virtual = jail::canonicalize(&filename);
        let metered = MeteredFileHandle::new(
            file,
            mode,
            canonical_virtual,
            self.connection_id,
            self.username.clone(),
            self.counters.clone(),
        );
        let handle_id = self.next_handle_id();
        self.files.insert(handle_id.clone(), OpenFile { handle: metered });

        Ok(Handle { id, handle: handle_id })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(mut open_file) = self.files.remove(&handle) {
            open_file.handle.close();
            let _ = open_file.handle.sync_all().await;
        }
        self.dirs.remove(&handle);
        Ok(ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let open_file = self
            .files
            .get_mut(&handle)
            .ok_or(StatusCode::Failure)?;
        let data = open_file
            .handle
            .read_at(offset, len)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        if data.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let open_file = self
            .files
            .get_mut(&handle)
            .ok_or(StatusCode::Failure)?;
        open_file
            .handle
            .write_at(offset, &data)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(ok_status(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        // Unlike every other verb, lstat must not follow a final-component
        // symlink (spec §4.5), so it resolves through a dedicated jail
        // helper rather than `self.resolve`.
        let host_path =
            jail::resolve_leaf_no_follow(&path, &self.home).map_err(|e| status_for(&e, false))?;
        let meta = tokio::fs::symlink_metadata(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(Attrs { id, attrs: metadata_to_attrs(&meta) })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let open_file = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let meta = open_file
            .handle
            .metadata()
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(Attrs { id, attrs: metadata_to_attrs(&meta) })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let host_path = self.resolve(&path).map_err(|e| status_for(&e, false))?;
        if let Some(size) = attrs.size {
            tokio::fs::OpenOptions::new()
                .write(true)
                .open(&host_path)
                .await
                .map_err(|e| status_for(&CoreError::Io(e), false))?
                .set_len(size)
                .await
                .map_err(|e| status_for(&CoreError::Io(e), false))?;
        }
        #[cfg(unix)]
        if let Some(mode_bits) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(mode_bits))
                .await
                .map_err(|e| status_for(&CoreError::Io(e), false))?;
        }
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let open_file = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        if let Some(size) = attrs.size {
            open_file
                .handle
                .set_len(size)
                .await
                .map_err(|e| status_for(&CoreError::Io(e), false))?;
        }
        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let host_path = self.resolve(&path).map_err(|e| status_for(&e, false))?;
        // A non-directory target also reads as "no such directory" to the
        // client, same as a missing path (spec §4.5 list verb note).
        let mut read_dir = tokio::fs::read_dir(&host_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                status_for(&CoreError::Io(e), false)
            } else {
                StatusCode::NoSuchFile
            }
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?
        {
            entries.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
        entries.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));

        let handle_id = self.next_handle_id();
        self.dirs.insert(handle_id.clone(), OpenDir { entries, offset: 0 });
        Ok(Handle { id, handle: handle_id })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let dir = self.dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;
        if dir.offset >= dir.entries.len() {
            return Err(StatusCode::Eof);
        }

        let mut files = Vec::new();
        for (name, path) in &dir.entries[dir.offset..] {
            let meta = match tokio::fs::symlink_metadata(path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            files.push(File {
                filename: name.clone(),
                longname: long_name(name, &meta),
                attrs: metadata_to_attrs(&meta),
            });
        }
        dir.offset = dir.entries.len();
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let host_path = self.resolve(&filename).map_err(|e| status_for(&e, false))?;
        tokio::fs::remove_file(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let host_path = self.resolve(&path).map_err(|e| status_for(&e, false))?;
        tokio::fs::create_dir(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        #[cfg(unix)]
        if let Some(mode_bits) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            let _ =
                tokio::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(mode_bits))
                    .await;
        }
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let host_path = self.resolve(&path).map_err(|e| status_for(&e, false))?;
        tokio::fs::remove_dir(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let canonical = jail::canonicalize(&path);
        Ok(Name {
            id,
            files: vec![File {
                filename: canonical.clone(),
                longname: canonical,
                attrs: FileAttributes::default(),
            }],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let host_path = self.resolve(&path).map_err(|e| status_for(&e, false))?;
        let meta = tokio::fs::metadata(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(Attrs { id, attrs: metadata_to_attrs(&meta) })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.resolve(&oldpath).map_err(|e| status_for(&e, false))?;
        let to = self.resolve(&newpath).map_err(|e| status_for(&e, false))?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let host_path = self.resolve(&path).map_err(|e| status_for(&e, false))?;
        let target = tokio::fs::read_link(&host_path)
            .await
            .map_err(|e| status_for(&CoreError::Io(e), false))?;
        let target_str = target.to_string_lossy().into_owned();
        Ok(Name {
            id,
            files: vec![File {
                filename: target_str.clone(),
                longname: target_str,
                attrs: FileAttributes::default(),
            }],
        })
    }

    async fn symlink(
        &mut self,
        _id: u32,
        _linkpath: String,
        _targetpath: String,
    ) -> Result<Status, Self::Error> {
        // Symlink creation is explicitly out of scope (Non-goals).
        Err(StatusCode::OpUnsupported)
    }
}
