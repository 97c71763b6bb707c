use log::{debug, info, warn};
use shared::discovery::{scan_servers, KeyValueStore, ServerDescriptor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a sleeping scanner checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Latest snapshot of live game servers, shared between the scanner and the
/// discovery handlers.
#[derive(Clone, Default)]
pub struct ServerDirectory {
    servers: Arc<Mutex<Vec<ServerDescriptor>>>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole snapshot. Servers missing from `servers` are gone.
    pub fn replace(&self, servers: Vec<ServerDescriptor>) {
        *self.lock() = servers;
    }

    pub fn snapshot(&self) -> Vec<ServerDescriptor> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The server with the fewest players; ties go to the first one listed.
    pub fn least_loaded(&self) -> Option<ServerDescriptor> {
        self.lock()
            .iter()
            .min_by_key(|server| server.player_count)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ServerDescriptor>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads the registry once into `directory`. An unreachable registry leaves
/// the directory empty.
pub fn scan_once(store: &dyn KeyValueStore, directory: &ServerDirectory) -> usize {
    match scan_servers(store) {
        Ok(servers) => {
            let count = servers.len();
            if count != directory.len() {
                info!("Registry now lists {} game servers", count);
            }
            directory.replace(servers);
            count
        }
        Err(e) => {
            warn!("Registry scan failed: {}", e);
            directory.replace(Vec::new());
            0
        }
    }
}

/// Background thread that rescans the registry at a fixed interval.
///
/// Registry calls block, so the scanner gets a thread of its own instead of
/// a runtime worker.
pub struct Scanner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn start(
        store: Arc<dyn KeyValueStore>,
        directory: ServerDirectory,
        interval: Duration,
    ) -> std::io::Result<Scanner> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("registry-scanner".to_string())
            .spawn(move || {
                debug!("Registry scanner started, interval {:?}", interval);
                while !flag.load(Ordering::SeqCst) {
                    scan_once(store.as_ref(), &directory);

                    let deadline = Instant::now() + interval;
                    while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
                        thread::sleep(STOP_POLL.min(interval));
                    }
                }
                debug!("Registry scanner stopped");
            })?;

        Ok(Scanner {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to finish its current scan.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Registry scanner panicked");
            }
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::discovery::{MemoryStore, ServiceRegistration};
    use shared::Endpoint;

    fn descriptor(name: &str, port: u16, player_count: i64) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            player_count,
        }
    }

    #[test]
    fn test_least_loaded_picks_minimum() {
        let directory = ServerDirectory::new();
        assert!(directory.least_loaded().is_none());

        directory.replace(vec![descriptor("a", 4000, 3), descriptor("b", 4001, 1)]);
        assert_eq!(directory.least_loaded().unwrap().name, "b");
    }

    #[test]
    fn test_least_loaded_tie_goes_to_first() {
        let directory = ServerDirectory::new();
        directory.replace(vec![
            descriptor("a", 4000, 2),
            descriptor("b", 4001, 1),
            descriptor("c", 4002, 1),
        ]);
        assert_eq!(directory.least_loaded().unwrap().name, "b");
    }

    #[test]
    fn test_replace_drops_missing_servers() {
        let directory = ServerDirectory::new();
        directory.replace(vec![descriptor("a", 4000, 0), descriptor("b", 4001, 0)]);
        directory.replace(vec![descriptor("b", 4001, 0)]);

        let names: Vec<String> = directory.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn test_scan_once_reads_registry() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let directory = ServerDirectory::new();

        let registration =
            ServiceRegistration::register(Arc::clone(&store), "alpha", &Endpoint::new("10.0.0.1", 4000))
                .unwrap();
        registration.player_joined().unwrap();

        assert_eq!(scan_once(store.as_ref(), &directory), 1);
        let server = directory.least_loaded().unwrap();
        assert_eq!(server.name, "alpha");
        assert_eq!(server.player_count, 1);
        assert_eq!(server.endpoint(), Endpoint::new("10.0.0.1", 4000));

        registration.deregister().unwrap();
        assert_eq!(scan_once(store.as_ref(), &directory), 0);
        assert!(directory.is_empty());
    }

    #[test]
    fn test_scanner_picks_up_new_servers_and_stops() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let directory = ServerDirectory::new();
        let mut scanner = Scanner::start(
            Arc::clone(&store),
            directory.clone(),
            Duration::from_millis(10),
        )
        .unwrap();

        let _registration =
            ServiceRegistration::register(Arc::clone(&store), "beta", &Endpoint::new("127.0.0.1", 4100))
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while directory.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(directory.len(), 1);

        scanner.stop();
        scanner.stop();
    }
}
