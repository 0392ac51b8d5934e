//! The store: an index database plus a flat blob tree, owned exclusively by
//! the store process.
//!
//! Layout below the base directory (the process' chroot): `/db` holds the
//! index database, `/data/<id>` holds one file per blob.  For every index
//! entry a blob exists and vice versa; the sweeper converges the two after a
//! crash left an orphan on either side.

pub mod id;

pub use id::IdGenerator;

use crate::{
    config::{Config, IdGeneratorConfig},
    error::{Error, Result},
    item::Item,
    net::Fd,
    process,
    rpc::{Fault, FdChannel, Handler, StoreServer},
    sandbox::{self, Jail, Role},
};
use chrono::Utc;
use filedrop_log::{debug, info, warn};
use redb::{Database, ReadableTable, TableDefinition};
use std::{
    fs,
    os::unix::{fs::DirBuilderExt, io::IntoRawFd},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::AsyncRead,
    signal::unix::{signal, SignalKind},
    sync::{watch, Mutex},
    time::interval,
};

const DIR_DATABASE: &str = "db";
const DIR_STORAGE: &str = "data";

/// How long the sweeper sleeps between two passes.  Doubles as the minimum
/// age before an orphaned blob is collected, so a pass never races an upload
/// whose index entry is yet to be written.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Attempts at minting an unused id before giving up.
const ID_MINT_ATTEMPTS: usize = 32;

const ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("items");

/// Index plus blob tree.
pub struct Store {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct Inner {
    base: PathBuf,
    db: Database,
    generator: IdGenerator,
    cleanup: bool,
}

struct Sweeper {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Store {
    /// Open or initialize a store below `base`.
    ///
    /// With `cleanup` enabled, a background sweeper collects expired items
    /// and `get` deletes lazily.
    pub fn open(base: impl Into<PathBuf>, generator: IdGenerator, cleanup: bool) -> Result<Store> {
        let base = base.into();
        info!("Opening store"; "directory" => base.display().to_string());

        for dir in [base.clone(), base.join(DIR_DATABASE), base.join(DIR_STORAGE)] {
            if dir.is_dir() {
                continue;
            }

            fs::DirBuilder::new()
                .mode(0o700)
                .create(&dir)
                .map_err(|err| {
                    Error::Store(format!("cannot create {}: {}", dir.display(), err))
                })?;
        }

        let db = Database::create(base.join(DIR_DATABASE).join("index.redb"))
            .map_err(|err| Error::Store(format!("cannot open index: {}", err)))?;

        // Make sure the table exists for read transactions.
        let txn = db
            .begin_write()
            .map_err(|err| Error::Store(err.to_string()))?;
        txn.open_table(ITEMS)
            .map_err(|err| Error::Store(err.to_string()))?;
        txn.commit().map_err(|err| Error::Store(err.to_string()))?;

        let inner = Arc::new(Inner {
            base,
            db,
            generator,
            cleanup,
        });

        let sweeper = cleanup.then(|| {
            let (stop, mut stopped) = watch::channel(false);
            let inner = inner.clone();

            let task = tokio::spawn(async move {
                let mut ticker = interval(SWEEP_INTERVAL);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = stopped.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(fault) = inner.sweep().await {
                                warn!("Sweep failed"; "error" => fault.to_string());
                            }
                        }
                    }
                }
            });

            Sweeper { stop, task }
        });

        Ok(Store {
            inner,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Store a new item and its body, minting an id for it.
    ///
    /// The blob is written first and the index entry second; a crash in
    /// between leaves an orphaned blob for the sweeper.
    pub async fn put<R>(&self, mut item: Item, body: &mut R) -> std::result::Result<String, Fault>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let id = self.inner.mint_id()?;
        item.id = id.clone();
        debug!("Inserting item"; "id" => &id);

        let path = self.inner.blob_path(&id);
        let mut blob = tokio::fs::File::create(&path).await.map_err(Fault::io)?;
        tokio::io::copy(body, &mut blob).await.map_err(Fault::io)?;
        blob.sync_all().await.map_err(Fault::io)?;

        self.inner.index_insert(&item)?;

        Ok(id)
    }

    /// Fetch an item's metadata.
    ///
    /// An expired item is deleted on the spot and reported as missing.
    pub async fn get(&self, id: &str) -> std::result::Result<Item, Fault> {
        let item = match self.inner.index_get(id)? {
            Some(item) => item,
            None => {
                debug!("Requested item was not found"; "id" => id);
                return Err(Fault::not_found());
            }
        };

        if self.inner.cleanup && item.is_expired(Utc::now()) {
            info!("Requested item is expired, deleting"; "id" => id);
            self.delete(id).await?;
            return Err(Fault::not_found());
        }

        Ok(item)
    }

    /// Open an item's blob read-only.
    pub fn get_file(&self, id: &str) -> std::result::Result<Fd, Fault> {
        match fs::File::open(self.inner.blob_path(id)) {
            Ok(file) => Ok(Fd::from(file.into_raw_fd())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Fault::not_found()),
            Err(err) => Err(Fault::io(err)),
        }
    }

    /// Remove an item's index entry and blob.  Deleting a missing item is
    /// not an error.
    pub async fn delete(&self, id: &str) -> std::result::Result<(), Fault> {
        debug!("Deleting item"; "id" => id);

        self.inner.index_remove(id)?;

        match tokio::fs::remove_file(self.inner.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Fault::io(err)),
        }
    }

    /// Stop the sweeper and flush the index.
    pub async fn close(&self) {
        info!("Closing store");

        if let Some(sweeper) = self.sweeper.lock().await.take() {
            let _ = sweeper.stop.send(true);
            let _ = sweeper.task.await;
        }
    }

    #[cfg(test)]
    async fn sweep_now(&self) -> std::result::Result<(), Fault> {
        self.inner.sweep().await
    }
}

impl Inner {
    fn blob_path(&self, id: &str) -> PathBuf {
        self.base.join(DIR_STORAGE).join(id)
    }

    fn mint_id(&self) -> std::result::Result<String, Fault> {
        for _ in 0..ID_MINT_ATTEMPTS {
            let id = self.generator.generate()?;

            if self.index_get(&id)?.is_none() {
                return Ok(id);
            }
        }

        Err(Fault::id_exhaustion())
    }

    fn index_get(&self, id: &str) -> std::result::Result<Option<Item>, Fault> {
        let txn = self.db.begin_read().map_err(Fault::index)?;
        let table = txn.open_table(ITEMS).map_err(Fault::index)?;

        match table.get(id).map_err(Fault::index)? {
            Some(raw) => {
                let item = bincode::deserialize(raw.value()).map_err(Fault::index)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    fn index_insert(&self, item: &Item) -> std::result::Result<(), Fault> {
        let raw = bincode::serialize(item).map_err(Fault::index)?;

        let txn = self.db.begin_write().map_err(Fault::index)?;
        {
            let mut table = txn.open_table(ITEMS).map_err(Fault::index)?;
            table
                .insert(item.id.as_str(), raw.as_slice())
                .map_err(Fault::index)?;
        }
        txn.commit().map_err(Fault::index)
    }

    fn index_remove(&self, id: &str) -> std::result::Result<(), Fault> {
        let txn = self.db.begin_write().map_err(Fault::index)?;
        {
            let mut table = txn.open_table(ITEMS).map_err(Fault::index)?;
            table.remove(id).map_err(Fault::index)?;
        }
        txn.commit().map_err(Fault::index)
    }

    fn expired_ids(&self) -> std::result::Result<Vec<String>, Fault> {
        let now = Utc::now();
        let txn = self.db.begin_read().map_err(Fault::index)?;
        let table = txn.open_table(ITEMS).map_err(Fault::index)?;

        let mut expired = Vec::new();
        for entry in table.iter().map_err(Fault::index)? {
            let (key, value) = entry.map_err(Fault::index)?;
            let item: Item = bincode::deserialize(value.value()).map_err(Fault::index)?;

            if item.is_expired(now) {
                expired.push(key.value().to_string());
            }
        }

        Ok(expired)
    }

    /// One sweeper pass: expired items first, orphaned blobs second.
    async fn sweep(&self) -> std::result::Result<(), Fault> {
        for id in self.expired_ids()? {
            debug!("Deleting expired item"; "id" => &id);

            self.index_remove(&id)?;
            match tokio::fs::remove_file(self.blob_path(&id)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Fault::io(err)),
            }
        }

        self.collect_orphans().await
    }

    /// Remove blobs without an index entry.  Only blobs older than one sweep
    /// interval are touched, so an upload between blob write and index
    /// insert is left alone.
    async fn collect_orphans(&self) -> std::result::Result<(), Fault> {
        let mut entries = tokio::fs::read_dir(self.base.join(DIR_STORAGE))
            .await
            .map_err(Fault::io)?;

        while let Some(entry) = entries.next_entry().await.map_err(Fault::io)? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };

            // The blob may be gone again by now; skip whatever cannot be
            // inspected.
            let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            let age = modified.elapsed().unwrap_or_default();

            if age < SWEEP_INTERVAL || self.index_get(&name)?.is_some() {
                continue;
            }

            warn!("Removing orphaned blob"; "id" => &name);
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Fault::io(err)),
            }
        }

        Ok(())
    }
}

/// Entry point of the store child process.
pub async fn run(config: &Config) -> Result<()> {
    debug!("Starting store child");

    let generator = match &config.store.id_generator {
        IdGeneratorConfig::Random { length } => IdGenerator::random(*length),
        IdGeneratorConfig::Wordlist { wordlist, length } => {
            IdGenerator::from_wordlist(wordlist, *length)?
        }
    };

    sandbox::ensure_jail_dir(&config.store.path, &config.user, &config.group)?;
    sandbox::apply(
        Role::Store,
        &Jail {
            root: &config.store.path,
            user: &config.user,
            group: &config.group,
        },
    )?;

    // The chroot is in place: the store lives at the filesystem root now.
    let store = Arc::new(Store::open("/", generator, true)?);

    let rpc = Handler::from_raw_fd(process::RPC_FD)?;
    let fds = FdChannel::from_raw_fd(process::FDPASS_FD)?;
    let server = StoreServer::new(store.clone(), rpc, fds);

    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = server.run() => {
            warn!("RPC peer is gone, shutting down");
            result?;
        }
        _ = sigint.recv() => {
            info!("Stopping store");
        }
    }

    store.close().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{new_deletion_key, sanitize_filename};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    fn item(expires_in: i64) -> Item {
        let created = Utc::now();

        Item {
            id: String::new(),
            deletion_key: new_deletion_key(),
            burn_after_reading: false,
            filename: sanitize_filename("hi.txt"),
            content_type: "text/plain".to_string(),
            created,
            expires: created + ChronoDuration::seconds(expires_in),
            owners: HashMap::new(),
        }
    }

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), IdGenerator::random(4), true).unwrap();

        (dir, store)
    }

    #[tokio::test]
    async fn lifecycle() {
        let (_dir, store) = open_store().await;

        assert!(store.get("whatever").await.unwrap_err().is_not_found());

        let id = store.put(item(60), &mut &b"hello world"[..]).await.unwrap();

        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.filename, "hi.txt");

        let fd = store.get_file(&id).unwrap();
        let mut blob = tokio::fs::File::from_std(fd.into_file());
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut blob, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"hello world");

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap_err().is_not_found());
        assert!(store.get_file(&id).unwrap_err().is_not_found());

        // deleting twice is fine
        store.delete(&id).await.unwrap();

        store.close().await;
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (_dir, store) = open_store().await;

        let a = store.put(item(60), &mut &b"a"[..]).await.unwrap();
        let b = store.put(item(60), &mut &b"b"[..]).await.unwrap();

        assert_ne!(a, b);
        store.close().await;
    }

    #[tokio::test]
    async fn expired_items_vanish_on_get() {
        let (dir, store) = open_store().await;

        let id = store.put(item(-60), &mut &b"stale"[..]).await.unwrap();

        assert!(store.get(&id).await.unwrap_err().is_not_found());
        assert!(!dir.path().join(DIR_STORAGE).join(&id).exists());

        store.close().await;
    }

    #[tokio::test]
    async fn sweep_collects_expired_items() {
        let (dir, store) = open_store().await;

        let id = store.put(item(-60), &mut &b"stale"[..]).await.unwrap();

        store.sweep_now().await.unwrap();

        assert!(store.get(&id).await.unwrap_err().is_not_found());
        assert!(!dir.path().join(DIR_STORAGE).join(&id).exists());

        store.close().await;
    }

    #[tokio::test]
    async fn metadata_survives_the_index() {
        let (_dir, store) = open_store().await;

        let mut original = item(60);
        original.burn_after_reading = true;
        original
            .owners
            .insert(crate::item::OwnerKind::RemotePeer, "127.0.0.1".parse().unwrap());

        let id = store.put(original.clone(), &mut &b"x"[..]).await.unwrap();
        original.id = id.clone();

        assert_eq!(store.get(&id).await.unwrap(), original);

        store.close().await;
    }
}
