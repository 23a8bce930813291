//! Upload-pack handler: orchestrates the repo cache, pack cache, child
//! supervisor, and semaphore to answer one parsed request by producing
//! the same byte stream a direct `git upload-pack` would have, on the
//! caller's writer.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;

use crate::config::Config;
use crate::error::Error;
use crate::lock::LockManager;
use crate::pack_cache::{PackCache, PackCacheCleaner};
use crate::parser::Request;
use crate::pktline;
use crate::repo::RepoCache;
use crate::semaphore::UploadPackSemaphore;
use crate::supervisor;

/// Seam around spawning `git-upload-pack` itself (every other `git`
/// subcommand goes through [`crate::supervisor::git_command`] directly).
/// Kept separate so tests can assert invocation counts — e.g. that two
/// identical cacheable requests execute exactly one subprocess — without
/// needing a populated repository on disk for the mock to exec against.
#[cfg_attr(test, mockall::automock)]
pub trait UploadPackSpawner: Send + Sync {
    fn spawn(&self, mirror: &Path, protocol_version: u32) -> std::io::Result<Child>;
}

pub struct RealUploadPackSpawner;

impl UploadPackSpawner for RealUploadPackSpawner {
    fn spawn(&self, mirror: &Path, protocol_version: u32) -> std::io::Result<Child> {
        tokio::process::Command::new("git-upload-pack")
            .arg("--stateless-rpc")
            .arg(mirror)
            .env("GIT_PROTOCOL", format!("version={protocol_version}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

pub struct UploadPackHandler {
    config: Arc<Config>,
    locks: Arc<LockManager>,
    semaphore: Option<UploadPackSemaphore>,
    cleaner: Arc<PackCacheCleaner>,
    spawner: Arc<dyn UploadPackSpawner>,
}

impl UploadPackHandler {
    pub fn new(
        config: Arc<Config>,
        locks: Arc<LockManager>,
        semaphore: Option<UploadPackSemaphore>,
        spawner: Arc<dyn UploadPackSpawner>,
    ) -> Self {
        let cleaner = Arc::new(PackCacheCleaner::new(
            config.pack_cache_dir(),
            config.pack_cache_target_bytes,
            locks.clone(),
        ));
        UploadPackHandler {
            config,
            locks,
            semaphore,
            cleaner,
            spawner,
        }
    }

    /// Entry point for `POST /<repo_path>/git-upload-pack`.
    pub async fn run<W>(
        &self,
        repo_path: &str,
        auth: &str,
        protocol_version: u32,
        request: &Request,
        mut writer: W,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        if request.parse_error {
            let prefix = String::from_utf8_lossy(&request.input[..request.input.len().min(128)]);
            write_pack_error(&mut writer, &format!("Wrong upload pack input: {prefix}")).await?;
            return Ok(());
        }
        if request.wants.is_empty() {
            tracing::warn!("request without wants");
            return Ok(());
        }

        let rcache = Arc::new(RepoCache::new(&self.config, self.locks.clone(), repo_path, auth));

        if request.can_be_cached(self.config.pack_cache_multi, self.config.pack_cache_depth) {
            let pcache = self.run_with_cache(protocol_version, request, rcache).await?;
            pcache.serve(&mut writer).await?;
        } else {
            self.execute(protocol_version, request, rcache, Sink::Direct(&mut writer))
                .await?;
        }
        Ok(())
    }

    /// Double-checked cache lookup/populate; returns the now-valid cache
    /// entry so the caller can serve it.
    async fn run_with_cache(
        &self,
        protocol_version: u32,
        request: &Request,
        rcache: Arc<RepoCache>,
    ) -> Result<Arc<PackCache>, Error> {
        let pcache = Arc::new(PackCache::new(
            self.config.pack_cache_dir(),
            self.locks.clone(),
            &request.fingerprint,
        ));

        {
            let _guard = pcache.read_lock().await?;
            if pcache.exists() {
                return Ok(pcache);
            }
        }

        {
            let _guard = pcache.write_lock().await?;
            if !pcache.exists() {
                self.execute(
                    protocol_version,
                    request,
                    rcache,
                    Sink::Cache(pcache.clone()),
                )
                .await?;
            }
        }

        {
            let _guard = pcache.read_lock().await?;
            if pcache.exists() {
                self.cleaner.clone().clean_in_background();
                return Ok(pcache);
            }
        }

        Err(Error::Io(std::io::Error::other(
            "pack cache populate left no entry behind",
        )))
    }

    /// Ensures the mirror actually has every wanted commit, then spawns
    /// `git-upload-pack` against it.
    async fn execute<W>(
        &self,
        protocol_version: u32,
        request: &Request,
        rcache: Arc<RepoCache>,
        sink: Sink<'_, W>,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        rcache.ensure_contains(&request.wants).await?;
        self.run_git_upload_pack(protocol_version, &request.input, &rcache, sink)
            .await
    }

    async fn run_git_upload_pack<W>(
        &self,
        protocol_version: u32,
        input: &[u8],
        rcache: &RepoCache,
        sink: Sink<'_, W>,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        let _read_guard = rcache.acquire_read().await?;
        let _permit = match &self.semaphore {
            Some(sem) => Some(sem.acquire().await),
            None => None,
        };

        let mut child = self.spawner.spawn(rcache.directory(), protocol_version)?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let input = input.to_vec();

        let write_fut = async move {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    // Large input + an early upload-pack error (e.g. "not
                    // our ref") closes stdin before we finish writing.
                    tracing::warn!("ignoring broken pipe while writing to upload-pack stdin");
                }
                Err(e) => return Err(Error::Io(e)),
            }
            drop(stdin);
            Ok(())
        };

        let (wait_timeout, write_result, stream_result) = match sink {
            Sink::Direct(writer) => {
                let chunk_size = self.config.chunk_size;
                let stream_fut = stream_chunks(stdout, writer, chunk_size);
                let (w, s) = tokio::join!(write_fut, stream_fut);
                (self.config.git_process_wait_timeout, w, s)
            }
            Sink::Cache(pcache) => {
                // The cache write must survive even if the client that
                // triggered it disconnects: detach it so later readers
                // still benefit from a warmed cache.
                let shielded = tokio::spawn(async move { pcache.populate(stdout).await });
                let write_result = write_fut.await;
                let stream_result = shielded
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
                (Duration::from_secs(600), write_result, stream_result)
            }
        };

        let status = supervisor::ensure_terminated(&mut child, wait_timeout, "git upload-pack").await;
        if let Some(status) = &status {
            if !status.success() {
                let mut stderr_buf = Vec::new();
                if let Some(mut stderr) = child.stderr.take() {
                    let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut stderr_buf).await;
                }
                tracing::warn!(
                    reason = %supervisor::stderr_for_log(&stderr_buf),
                    "upload pack failure"
                );
            }
        }

        write_result?;
        stream_result?;
        Ok(())
    }
}

enum Sink<'a, W> {
    Direct(&'a mut W),
    Cache(Arc<PackCache>),
}

async fn write_pack_error<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<(), Error> {
    tracing::error!(pack_error = %message, "upload pack, sending error to client");
    let pkt = pktline::encode(format!("ERR {message}").as_bytes(), None);
    writer.write_all(&pkt).await?;
    Ok(())
}

async fn stream_chunks<R, W>(mut reader: R, writer: &mut W, chunk_size: usize) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn cacheable_request(want: &str) -> Request {
        let mut body = Vec::new();
        body.extend(crate::pktline::encode(
            format!("want {want} side-band-64k\n").as_bytes(),
            None,
        ));
        body.extend(crate::pktline::flush());
        body.extend(crate::pktline::encode(b"done\n", None));
        let request = Request::parse(&body, 1);
        assert!(request.can_be_cached(false, false));
        request
    }

    /// Commits one file into a scratch working tree and clones it bare into
    /// `bare_dir`, returning the commit's OID. Gives `ensure_contains` a
    /// mirror that genuinely already has the requested want, so the test
    /// never depends on reaching the (fake, unreachable) upstream URL.
    fn make_bare_repo_with_commit(bare_dir: &Path) -> String {
        let work = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .current_dir(work.path())
                .args(args)
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.invalid"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(work.path().join("file.txt"), b"hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);

        let output = std::process::Command::new("git")
            .current_dir(work.path())
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let oid = String::from_utf8(output.stdout).unwrap().trim().to_string();

        if let Some(parent) = bare_dir.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let status = std::process::Command::new("git")
            .args(["clone", "-q", "--bare"])
            .arg(work.path())
            .arg(bare_dir)
            .status()
            .unwrap();
        assert!(status.success());
        oid
    }

    /// Two back-to-back identical cacheable requests must execute exactly
    /// one `git-upload-pack` subprocess. The
    /// mock spawns a tiny real child (`cat` piped into a literal flush
    /// packet) so the surrounding stdin/stdout plumbing exercises exactly
    /// what it would against the real binary.
    #[tokio::test]
    async fn identical_cacheable_requests_spawn_upload_pack_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            Config::from_env(dir.path().to_path_buf(), "https://example.invalid".to_string())
                .unwrap(),
        );
        let locks = Arc::new(LockManager::new());
        let repo_path = "group/repo.git";

        let oid = make_bare_repo_with_commit(&config.git_dir().join(repo_path));

        let mut mock = MockUploadPackSpawner::new();
        mock.expect_spawn().times(1).returning(|_mirror, _proto| {
            std::process::Command::new("sh")
                .arg("-c")
                .arg("cat >/dev/null; printf '0000'")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .and_then(tokio::process::Child::from_std)
        });

        let handler = UploadPackHandler::new(config, locks, None, Arc::new(mock));
        let request = cacheable_request(&oid);

        let mut first = Vec::new();
        handler
            .run(repo_path, "", 1, &request, &mut first)
            .await
            .unwrap();

        let mut second = Vec::new();
        handler
            .run(repo_path, "", 1, &request, &mut second)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, crate::pktline::flush());
    }
}
