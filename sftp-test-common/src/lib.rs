//! In-memory sftp v3 server used by the tests of `sftp-engine`.
//!
//! [`MockServer::serve`] spawns the server on the current tokio runtime
//! and returns the client side of a pair of in-memory pipes. The file
//! tree, the faults and the log of received requests live behind the
//! [`MockServer`], which can be inspected and reconfigured while the
//! session is running.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use sftp_engine_lowlevel::constants::{EXT_FSYNC, EXT_HARDLINK, EXT_LIMITS, EXT_POSIX_RENAME};
use sftp_engine_lowlevel::{
    decode_handle, decode_two_paths, FileAttrs, FileType, Handle, Hello, NameEntry, OpenFlags,
    Request, RequestInner, Response, ResponseInner, ServerVersion, SftpErrorKind, StatusCode,
    UnixTimeStamp,
};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, Notify};

pub use sftp_engine_lowlevel::{Limits, RequestKind};

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Modification time given to every node created by the server.
pub const MTIME: u32 = 1_700_000_000;

/// Access time given to every node created by the server.
pub const ATIME: u32 = 1_700_000_100;

/// Owner of every node.
pub const UID: u32 = 1000;

/// Group of every node.
pub const GID: u32 = 100;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
    Symlink { target: String },
}

impl Node {
    fn attrs(&self) -> FileAttrs {
        let mut attrs = FileAttrs::new();
        match self {
            Node::File { data, mode } => {
                attrs.set_size(data.len() as u64);
                attrs.set_mode(S_IFREG | mode);
            }
            Node::Dir { mode } => {
                attrs.set_size(4096);
                attrs.set_mode(S_IFDIR | mode);
            }
            Node::Symlink { target } => {
                attrs.set_size(target.len() as u64);
                attrs.set_mode(S_IFLNK | 0o777);
            }
        }
        attrs.set_id(UID, GID);
        attrs.set_time(UnixTimeStamp::from_raw(ATIME), UnixTimeStamp::from_raw(MTIME));
        attrs
    }
}

#[derive(Debug)]
enum OpenHandle {
    File { path: String, flags: OpenFlags },
    Dir { entries: Vec<NameEntry> },
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<Bytes, OpenHandle>,
    next_handle: u64,

    read_failures: HashMap<u64, u32>,
    write_failures: HashMap<u64, u32>,
    swallowed: HashSet<RequestKind>,
    swallow_reads_from: Option<u64>,
    read_cap: Option<usize>,
    readdir_batch: usize,
    reorder: bool,
    listed_names: HashMap<String, String>,

    limits: Option<Limits>,
    posix_rename: bool,
    version: u32,

    requests: Vec<RequestKind>,
    injector: Option<mpsc::UnboundedSender<Bytes>>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    kill: Notify,
}

/// Handle to an in-memory sftp server, cheap to clone.
#[derive(Debug, Clone)]
pub struct MockServer(Arc<Shared>);

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn any path the client sends into an absolute path without `.`,
/// `..` or repeated separators.
pub fn normalize(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                components.pop();
            }
            component => components.push(component),
        }
    }
    format!("/{}", components.join("/"))
}

fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn status(code: StatusCode, msg: &str) -> ResponseInner {
    ResponseInner::status(code, msg)
}

fn ok() -> ResponseInner {
    status(StatusCode::Success, "Success")
}

fn failure(kind: SftpErrorKind) -> ResponseInner {
    let msg = match kind {
        SftpErrorKind::Eof => "End of file",
        SftpErrorKind::NoSuchFile => "No such file",
        SftpErrorKind::PermDenied => "Permission denied",
        SftpErrorKind::OpUnsupported => "Operation unsupported",
        _ => "Failure",
    };
    status(StatusCode::Failure(kind), msg)
}

fn text(bytes: &Bytes) -> String {
    normalize(&String::from_utf8_lossy(bytes))
}

impl MockServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::Dir { mode: 0o755 });

        Self(Arc::new(Shared {
            state: Mutex::new(State {
                nodes,
                handles: HashMap::new(),
                next_handle: 0,

                read_failures: HashMap::new(),
                write_failures: HashMap::new(),
                swallowed: HashSet::new(),
                swallow_reads_from: None,
                read_cap: None,
                readdir_batch: 3,
                reorder: false,
                listed_names: HashMap::new(),

                limits: None,
                posix_rename: true,
                version: 3,

                requests: Vec::new(),
                injector: None,
            }),
            kill: Notify::new(),
        }))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a directory, creating missing parents.
    pub fn add_dir(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state();

        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            state
                .nodes
                .entry(current.clone())
                .or_insert(Node::Dir { mode: 0o755 });
        }
    }

    /// Add a regular file with mode `0644`, creating missing parents.
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = normalize(path);
        if let Some(parent) = parent(&path) {
            self.add_dir(parent);
        }
        self.state().nodes.insert(
            path,
            Node::File {
                data: data.into(),
                mode: 0o644,
            },
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = normalize(path);
        if let Some(parent) = parent(&path) {
            self.add_dir(parent);
        }
        self.state().nodes.insert(
            path,
            Node::Symlink {
                target: target.to_owned(),
            },
        );
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state().nodes.get(&normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().nodes.contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.state().nodes.get(&normalize(path)),
            Some(Node::Dir { .. })
        )
    }

    /// Permission bits of the node, without the file type bits.
    pub fn permissions(&self, path: &str) -> Option<u32> {
        match self.state().nodes.get(&normalize(path))? {
            Node::File { mode, .. } | Node::Dir { mode } => Some(*mode),
            Node::Symlink { .. } => Some(0o777),
        }
    }

    /// Fail the next `times` READs at exactly `offset` with `SSH_FX_FAILURE`.
    pub fn fail_reads_at(&self, offset: u64, times: u32) {
        self.state().read_failures.insert(offset, times);
    }

    /// Fail the next `times` WRITEs at exactly `offset` with `SSH_FX_FAILURE`.
    pub fn fail_writes_at(&self, offset: u64, times: u32) {
        self.state().write_failures.insert(offset, times);
    }

    /// Never answer requests of `kind`.
    pub fn swallow(&self, kind: RequestKind) {
        self.state().swallowed.insert(kind);
    }

    /// Never answer READs at or beyond `offset`.
    pub fn swallow_reads_from(&self, offset: u64) {
        self.state().swallow_reads_from = Some(offset);
    }

    /// Return at most `cap` bytes per READ.
    pub fn set_read_cap(&self, cap: usize) {
        self.state().read_cap = Some(cap);
    }

    /// Number of entries returned per READDIR.
    pub fn set_readdir_batch(&self, batch: usize) {
        self.state().readdir_batch = batch.max(1);
    }

    /// Answer every batch of requests that arrive together in reverse
    /// order.
    pub fn set_reorder(&self, reorder: bool) {
        self.state().reorder = reorder;
    }

    /// List the node at `path` as `name` in READDIR replies, whatever
    /// `name` contains.
    pub fn list_as(&self, path: &str, name: &str) {
        self.state()
            .listed_names
            .insert(normalize(path), name.to_owned());
    }

    /// Advertise `limits@openssh.com` and answer it with `limits`.
    pub fn set_limits(&self, limits: Limits) {
        self.state().limits = Some(limits);
    }

    pub fn set_posix_rename(&self, advertise: bool) {
        self.state().posix_rename = advertise;
    }

    /// Version sent in `SSH_FXP_VERSION`.
    pub fn set_version(&self, version: u32) {
        self.state().version = version;
    }

    /// Kinds of every request received so far, in order.
    pub fn requests(&self) -> Vec<RequestKind> {
        self.state().requests.clone()
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.state().requests.iter().filter(|k| **k == kind).count()
    }

    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    /// Send a raw packet to the client as soon as possible.
    pub fn inject(&self, packet: Bytes) {
        if let Some(injector) = &self.state().injector {
            let _ = injector.send(packet);
        }
    }

    /// Stop serving and close the pipes, as if the transport died.
    pub fn kill(&self) {
        self.0.kill.notify_one();
    }

    /// Spawn the server and return the `(writer, reader)` the client
    /// should use.
    pub fn serve(&self) -> (DuplexStream, DuplexStream) {
        let (client_writer, server_reader) = duplex(1024 * 1024);
        let (server_writer, client_reader) = duplex(1024 * 1024);

        let (injector, injected) = mpsc::unbounded_channel();
        self.state().injector = Some(injector);

        tokio::spawn(self.clone().run(server_reader, server_writer, injected));

        (client_writer, client_reader)
    }

    async fn run(
        self,
        reader: DuplexStream,
        mut writer: DuplexStream,
        mut injected: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let mut reader = BufReader::new(reader);

        let Some(packet) = read_packet(&mut reader).await else {
            return;
        };
        if Hello::decode(packet).is_err() {
            return;
        }
        let version = self.version();
        if writer.write_all(&version.encode()).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                biased;

                _ = self.0.kill.notified() => return,

                Some(packet) = injected.recv() => {
                    if writer.write_all(&packet).await.is_err() {
                        return;
                    }
                    continue;
                }

                res = reader.fill_buf() => match res {
                    Ok(buf) if !buf.is_empty() => (),
                    _ => return,
                },
            }

            let Some(packet) = read_packet(&mut reader).await else {
                return;
            };
            let mut batch = vec![packet];

            let reorder = self.state().reorder;
            if reorder {
                while let Ok(Ok(buf)) =
                    tokio::time::timeout(Duration::from_millis(5), reader.fill_buf()).await
                {
                    if buf.is_empty() {
                        break;
                    }
                    match read_packet(&mut reader).await {
                        Some(packet) => batch.push(packet),
                        None => return,
                    }
                }
            }

            let mut responses = Vec::with_capacity(batch.len());
            for packet in batch {
                let Ok(request) = Request::decode(packet) else {
                    return;
                };
                if let Some(response) = self.handle(request) {
                    responses.push(response);
                }
            }

            if reorder {
                responses.reverse();
            }

            for response in responses {
                if writer.write_all(&response.encode()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn version(&self) -> ServerVersion {
        let state = self.state();

        let mut extensions = vec![
            (
                Bytes::from_static(EXT_FSYNC.as_bytes()),
                Bytes::from_static(b"1"),
            ),
            (
                Bytes::from_static(EXT_HARDLINK.as_bytes()),
                Bytes::from_static(b"1"),
            ),
        ];
        if state.posix_rename {
            extensions.push((
                Bytes::from_static(EXT_POSIX_RENAME.as_bytes()),
                Bytes::from_static(b"1"),
            ));
        }
        if state.limits.is_some() {
            extensions.push((
                Bytes::from_static(EXT_LIMITS.as_bytes()),
                Bytes::from_static(b"1"),
            ));
        }

        ServerVersion {
            version: state.version,
            extensions,
        }
    }

    fn handle(&self, request: Request) -> Option<Response> {
        let mut state = self.state();

        let kind = request.inner.kind();
        state.requests.push(kind);

        if state.swallowed.contains(&kind) {
            return None;
        }

        let inner = state.process(request.inner)?;

        Some(Response {
            response_id: request.request_id,
            inner,
        })
    }
}

async fn read_packet(reader: &mut BufReader<DuplexStream>) -> Option<Bytes> {
    let len = reader.read_u32().await.ok()?;
    let mut packet = vec![0; len as usize + 4];
    packet[..4].copy_from_slice(&len.to_be_bytes());
    reader.read_exact(&mut packet[4..]).await.ok()?;
    Some(Bytes::from(packet))
}

impl State {
    fn node(&self, path: &str) -> Result<&Node, ResponseInner> {
        self.nodes
            .get(path)
            .ok_or_else(|| failure(SftpErrorKind::NoSuchFile))
    }

    /// Follow symlinks, up to a small depth.
    fn resolve(&self, path: &str) -> Result<(String, &Node), ResponseInner> {
        let mut path = path.to_owned();
        for _ in 0..8 {
            match self.node(&path)? {
                Node::Symlink { target } => {
                    path = if target.starts_with('/') {
                        normalize(target)
                    } else {
                        normalize(&format!("{}/{}", parent(&path).unwrap_or("/"), target))
                    };
                }
                node => return Ok((path, node)),
            }
        }
        Err(failure(SftpErrorKind::Failure))
    }

    fn ensure_parent_dir(&self, path: &str) -> Result<(), ResponseInner> {
        match parent(path).map(|parent| self.nodes.get(parent)) {
            Some(Some(Node::Dir { .. })) => Ok(()),
            _ => Err(failure(SftpErrorKind::NoSuchFile)),
        }
    }

    fn new_handle(&mut self, handle: OpenHandle) -> Handle {
        let token = Bytes::from(format!("handle-{}", self.next_handle));
        self.next_handle += 1;
        self.handles.insert(token.clone(), handle);
        Handle::new(token).unwrap_or_else(|_| unreachable!("handle tokens are short"))
    }

    fn file_path(&self, handle: &Handle) -> Result<(String, OpenFlags), ResponseInner> {
        match self.handles.get(&Bytes::copy_from_slice(handle)) {
            Some(OpenHandle::File { path, flags }) => Ok((path.clone(), *flags)),
            _ => Err(failure(SftpErrorKind::Failure)),
        }
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        self.nodes
            .iter()
            .filter(|(path, _)| path.as_str() != "/" && parent(path) == Some(dir))
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect()
    }

    fn apply_attrs(&mut self, path: &str, attrs: &FileAttrs) -> Result<(), ResponseInner> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| failure(SftpErrorKind::NoSuchFile))?;

        if let Some(size) = attrs.get_size() {
            match node {
                Node::File { data, .. } => data.resize(size as usize, 0),
                _ => return Err(failure(SftpErrorKind::Failure)),
            }
        }
        if let Some(new_mode) = attrs.get_mode() {
            match node {
                Node::File { mode, .. } | Node::Dir { mode } => *mode = new_mode & 0o7777,
                Node::Symlink { .. } => (),
            }
        }
        Ok(())
    }

    fn rename(&mut self, oldpath: &str, newpath: &str, overwrite: bool) -> ResponseInner {
        if !self.nodes.contains_key(oldpath) {
            return failure(SftpErrorKind::NoSuchFile);
        }
        if let Err(err) = self.ensure_parent_dir(newpath) {
            return err;
        }
        match self.nodes.get(newpath) {
            Some(Node::Dir { .. }) => return failure(SftpErrorKind::Failure),
            Some(_) if !overwrite => return failure(SftpErrorKind::Failure),
            _ => (),
        }

        let prefix = format!("{oldpath}/");
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|path| path.as_str() == oldpath || path.starts_with(&prefix))
            .cloned()
            .collect();

        for path in moved {
            if let Some(node) = self.nodes.remove(&path) {
                let suffix = &path[oldpath.len()..];
                self.nodes.insert(format!("{newpath}{suffix}"), node);
            }
        }
        ok()
    }

    fn process(&mut self, request: RequestInner) -> Option<ResponseInner> {
        Some(match self.try_process(request)? {
            Ok(response) => response,
            Err(response) => response,
        })
    }

    /// `None` means no response is sent.
    fn try_process(&mut self, request: RequestInner) -> Option<Result<ResponseInner, ResponseInner>> {
        use RequestInner as R;

        let res = match request {
            R::Open {
                filename,
                flags,
                attrs,
            } => self.open(text(&filename), flags, &attrs),

            R::Close(handle) => match self.handles.remove(&handle.into_inner()) {
                Some(_) => Ok(ok()),
                None => Err(failure(SftpErrorKind::Failure)),
            },

            R::Read {
                handle,
                offset,
                len,
            } => {
                if matches!(self.swallow_reads_from, Some(from) if offset >= from) {
                    return None;
                }
                if let Some(remaining) = self.read_failures.get_mut(&offset) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Some(Err(failure(SftpErrorKind::Failure)));
                    }
                }
                self.read(&handle, offset, len)
            }

            R::Write {
                handle,
                offset,
                data,
            } => {
                if let Some(remaining) = self.write_failures.get_mut(&offset) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Some(Err(failure(SftpErrorKind::Failure)));
                    }
                }
                self.write(&handle, offset, &data)
            }

            R::Lstat(path) => self.node(&text(&path)).map(|node| ResponseInner::Attrs(node.attrs())),

            R::Stat(path) => self
                .resolve(&text(&path))
                .map(|(_, node)| ResponseInner::Attrs(node.attrs())),

            R::Fstat(handle) => self
                .file_path(&handle)
                .and_then(|(path, _)| self.node(&path).map(Node::attrs))
                .map(ResponseInner::Attrs),

            R::Setstat { path, attrs } => self.apply_attrs(&text(&path), &attrs).map(|()| ok()),

            R::Fsetstat { handle, attrs } => self
                .file_path(&handle)
                .and_then(|(path, _)| self.apply_attrs(&path, &attrs))
                .map(|()| ok()),

            R::Opendir(path) => self.opendir(&text(&path)),

            R::Readdir(handle) => {
                let batch = self.readdir_batch;
                match self.handles.get_mut(&handle.into_inner()) {
                    Some(OpenHandle::Dir { entries }) if entries.is_empty() => {
                        Err(failure(SftpErrorKind::Eof))
                    }
                    Some(OpenHandle::Dir { entries }) => {
                        let n = batch.min(entries.len());
                        Ok(ResponseInner::Name(entries.drain(..n).collect()))
                    }
                    _ => Err(failure(SftpErrorKind::Failure)),
                }
            }

            R::Remove(path) => {
                let path = text(&path);
                match self.node(&path) {
                    Ok(Node::Dir { .. }) => Err(failure(SftpErrorKind::Failure)),
                    Ok(_) => {
                        self.nodes.remove(&path);
                        Ok(ok())
                    }
                    Err(err) => Err(err),
                }
            }

            R::Mkdir { path, attrs } => {
                let path = text(&path);
                if self.nodes.contains_key(&path) {
                    Err(failure(SftpErrorKind::Failure))
                } else {
                    self.ensure_parent_dir(&path).map(|()| {
                        let mode = attrs.get_mode().map_or(0o755, |mode| mode & 0o7777);
                        self.nodes.insert(path, Node::Dir { mode });
                        ok()
                    })
                }
            }

            R::Rmdir(path) => {
                let path = text(&path);
                match self.node(&path) {
                    Ok(Node::Dir { .. }) if path == "/" => Err(failure(SftpErrorKind::PermDenied)),
                    Ok(Node::Dir { .. }) if !self.children(&path).is_empty() => {
                        Err(failure(SftpErrorKind::Failure))
                    }
                    Ok(Node::Dir { .. }) => {
                        self.nodes.remove(&path);
                        Ok(ok())
                    }
                    Ok(_) => Err(failure(SftpErrorKind::Failure)),
                    Err(err) => Err(err),
                }
            }

            R::Realpath(path) => {
                let path = text(&path);
                Ok(ResponseInner::Name(vec![NameEntry {
                    filename: Bytes::from(path.clone()),
                    longname: Bytes::from(path),
                    attrs: FileAttrs::new(),
                }]))
            }

            R::Rename { oldpath, newpath } => {
                Ok(self.rename(&text(&oldpath), &text(&newpath), false))
            }

            R::Readlink(path) => match self.node(&text(&path)) {
                Ok(Node::Symlink { target }) => Ok(ResponseInner::Name(vec![NameEntry {
                    filename: Bytes::from(target.clone()),
                    longname: Bytes::from(target.clone()),
                    attrs: FileAttrs::new(),
                }])),
                Ok(_) => Err(failure(SftpErrorKind::Failure)),
                Err(err) => Err(err),
            },

            R::Symlink {
                linkpath,
                targetpath,
            } => {
                let linkpath = text(&linkpath);
                if self.nodes.contains_key(&linkpath) {
                    Err(failure(SftpErrorKind::Failure))
                } else {
                    self.ensure_parent_dir(&linkpath).map(|()| {
                        let target = String::from_utf8_lossy(&targetpath).into_owned();
                        self.nodes.insert(linkpath, Node::Symlink { target });
                        ok()
                    })
                }
            }

            R::Extended { request, data } => self.extended(&request, data),
        };

        Some(res)
    }

    fn open(
        &mut self,
        path: String,
        flags: OpenFlags,
        attrs: &FileAttrs,
    ) -> Result<ResponseInner, ResponseInner> {
        let path = match self.resolve(&path) {
            Ok((resolved, _)) => resolved,
            Err(_) => path,
        };

        match self.nodes.get_mut(&path) {
            Some(Node::Dir { .. }) => return Err(failure(SftpErrorKind::Failure)),
            Some(Node::File { .. }) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) => {
                return Err(failure(SftpErrorKind::Failure))
            }
            Some(Node::File { data, .. }) => {
                if flags.contains(OpenFlags::TRUNC) {
                    data.clear();
                }
            }
            Some(Node::Symlink { .. }) => return Err(failure(SftpErrorKind::NoSuchFile)),
            None if flags.contains(OpenFlags::CREATE) => {
                self.ensure_parent_dir(&path)?;
                let mode = attrs.get_mode().map_or(0o644, |mode| mode & 0o7777);
                self.nodes.insert(
                    path.clone(),
                    Node::File {
                        data: Vec::new(),
                        mode,
                    },
                );
            }
            None => return Err(failure(SftpErrorKind::NoSuchFile)),
        }

        Ok(ResponseInner::Handle(
            self.new_handle(OpenHandle::File { path, flags }),
        ))
    }

    fn opendir(&mut self, path: &str) -> Result<ResponseInner, ResponseInner> {
        let (path, node) = self.resolve(path)?;
        if !matches!(node, Node::Dir { .. }) {
            return Err(failure(SftpErrorKind::Failure));
        }

        let mut entries = vec![
            NameEntry {
                filename: Bytes::from_static(b"."),
                longname: Bytes::from_static(b"."),
                attrs: node.attrs(),
            },
            NameEntry {
                filename: Bytes::from_static(b".."),
                longname: Bytes::from_static(b".."),
                attrs: Node::Dir { mode: 0o755 }.attrs(),
            },
        ];
        for (child, node) in self.children(&path) {
            let name = match self.listed_names.get(&child) {
                Some(name) => name.clone(),
                None => basename(&child).to_owned(),
            };
            entries.push(NameEntry {
                longname: Bytes::from(longname(&name, &node)),
                filename: Bytes::from(name),
                attrs: node.attrs(),
            });
        }

        Ok(ResponseInner::Handle(
            self.new_handle(OpenHandle::Dir { entries }),
        ))
    }

    fn read(&mut self, handle: &Handle, offset: u64, len: u32) -> Result<ResponseInner, ResponseInner> {
        let (path, flags) = self.file_path(handle)?;
        if !flags.contains(OpenFlags::READ) {
            return Err(failure(SftpErrorKind::PermDenied));
        }
        let Node::File { data, .. } = self.node(&path)? else {
            return Err(failure(SftpErrorKind::Failure));
        };

        let start = offset as usize;
        if start >= data.len() {
            return Err(failure(SftpErrorKind::Eof));
        }
        let mut end = data.len().min(start + len as usize);
        if let Some(cap) = self.read_cap {
            end = end.min(start + cap);
        }
        Ok(ResponseInner::Data(Bytes::copy_from_slice(&data[start..end])))
    }

    fn write(&mut self, handle: &Handle, offset: u64, bytes: &[u8]) -> Result<ResponseInner, ResponseInner> {
        let (path, flags) = self.file_path(handle)?;
        if !flags.contains(OpenFlags::WRITE) {
            return Err(failure(SftpErrorKind::PermDenied));
        }
        let Some(Node::File { data, .. }) = self.nodes.get_mut(&path) else {
            return Err(failure(SftpErrorKind::NoSuchFile));
        };

        let start = if flags.contains(OpenFlags::APPEND) {
            data.len()
        } else {
            offset as usize
        };
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(ok())
    }

    fn extended(&mut self, request: &[u8], data: Bytes) -> Result<ResponseInner, ResponseInner> {
        let malformed = || failure(SftpErrorKind::BadMessage);

        match request {
            name if name == EXT_LIMITS.as_bytes() => match self.limits {
                Some(limits) => Ok(ResponseInner::ExtendedReply(limits.encode())),
                None => Err(failure(SftpErrorKind::OpUnsupported)),
            },
            name if name == EXT_FSYNC.as_bytes() => {
                let handle = decode_handle(data).map_err(|_| malformed())?;
                self.file_path(&handle).map(|_| ok())
            }
            name if name == EXT_POSIX_RENAME.as_bytes() && self.posix_rename => {
                let (oldpath, newpath) = decode_two_paths(data).map_err(|_| malformed())?;
                Ok(self.rename(&text(&oldpath), &text(&newpath), true))
            }
            name if name == EXT_HARDLINK.as_bytes() => {
                let (oldpath, newpath) = decode_two_paths(data).map_err(|_| malformed())?;
                let (oldpath, newpath) = (text(&oldpath), text(&newpath));
                let node = match self.node(&oldpath)? {
                    node @ Node::File { .. } => node.clone(),
                    _ => return Err(failure(SftpErrorKind::Failure)),
                };
                if self.nodes.contains_key(&newpath) {
                    return Err(failure(SftpErrorKind::Failure));
                }
                self.ensure_parent_dir(&newpath)?;
                self.nodes.insert(newpath, node);
                Ok(ok())
            }
            _ => Err(failure(SftpErrorKind::OpUnsupported)),
        }
    }
}

fn longname(name: &str, node: &Node) -> String {
    let attrs = node.attrs();
    let kind = match attrs.get_filetype() {
        Some(FileType::Directory) => 'd',
        Some(FileType::Symlink) => 'l',
        _ => '-',
    };
    format!(
        "{kind}{:o} 1 {UID} {GID} {} {name}",
        attrs.get_mode().unwrap_or(0) & 0o777,
        attrs.get_size().unwrap_or(0)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("/a//b/./c/.."), "/a/b");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/.."), "/");
    }

    #[test]
    fn parents() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b"), Some("/a"));
    }

    #[test]
    fn rename_moves_subtree() {
        let server = MockServer::new();
        server.add_file("/a/x/f", b"data".to_vec());

        let response = server.state().rename("/a", "/b", false);
        assert_eq!(response, ok());
        assert_eq!(server.file_content("/b/x/f"), Some(b"data".to_vec()));
        assert!(!server.exists("/a"));
    }
}
