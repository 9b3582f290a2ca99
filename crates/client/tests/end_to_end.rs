//! Client and server wired together.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetcache_client::{
    CacheClient, CacheConfig, Completion, RequestError, RequestResult, Resolution,
    build_cache_manager,
};
use assetcache_protocol::CacheKey;
use assetcache_server::{CacheServer, ServerConfig};
use assetcache_transfer::cache_key_for_file;
use assetcache_transport::{MemoryNetwork, TcpListenerTransport, event};
use filetime::{FileTime, set_file_mtime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_millis(100);
const MIB: usize = 1024 * 1024;

type Results = Arc<Mutex<Vec<(CacheKey, RequestResult)>>>;

fn completion(results: &Results) -> Completion {
    let results = results.clone();
    Box::new(move |key, result| results.lock().unwrap().push((key.clone(), result)))
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

/// A cache server and any number of clients on one memory network.
struct Cluster {
    dir: TempDir,
    network: MemoryNetwork,
    server: CacheServer,
}

impl Cluster {
    fn new(quota_mb: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = event::channel();
        let config = ServerConfig {
            cache_dir: dir.path().join("server"),
            quota_mb,
            ..ServerConfig::default()
        };
        let server = CacheServer::new(config, rx).unwrap();
        Self {
            dir,
            network: MemoryNetwork::new(tx),
            server,
        }
    }

    fn server_dir(&self) -> PathBuf {
        self.dir.path().join("server")
    }

    fn client(&self, name: &str, identity: &str) -> CacheClient {
        let local = self.dir.path().join(name);
        std::fs::create_dir_all(&local).unwrap();
        let config = CacheConfig {
            use_server: true,
            identifier: identity.into(),
            local_cache_dir: local,
            ..CacheConfig::default()
        };
        CacheClient::new(config, Box::new(self.network.connector(identity)))
    }

    /// Ticks everything until `results` holds `count` entries.
    fn run_until(&mut self, client: &mut CacheClient, results: &Results, count: usize, step: Duration) {
        for _ in 0..500 {
            client.tick(step);
            self.network.pump();
            self.server.tick(step);
            self.network.pump();
            if results.lock().unwrap().len() >= count {
                return;
            }
        }
        panic!("requests did not resolve; got {:?}", results.lock().unwrap());
    }
}

fn local(client: &CacheClient, name: &str) -> PathBuf {
    client.config().local_cache_dir.join(name)
}

#[test]
fn publish_then_fetch_from_another_client() {
    let mut cluster = Cluster::new(10);
    let content = patterned(3 * MIB + 17, 0x5a);
    let key = CacheKey::new("mesh.fbx", "abc123");

    let mut builder = cluster.client("builder", "AssetCacheClient");
    std::fs::write(local(&builder, "mesh.fbx"), &content).unwrap();
    let results = Results::default();
    builder.publish(key.clone(), completion(&results));
    cluster.run_until(&mut builder, &results, 1, STEP);

    assert_eq!(
        *results.lock().unwrap(),
        vec![(key.clone(), Ok(Resolution::Published))]
    );
    let stored = cluster.server_dir().join("mesh.[abc123].fbx");
    assert_eq!(std::fs::read(&stored).unwrap(), content);

    let mut consumer = cluster.client("consumer", "AssetCacheClient");
    let results = Results::default();
    consumer.fetch(key.clone(), completion(&results));
    cluster.run_until(&mut consumer, &results, 1, STEP);

    assert_eq!(
        *results.lock().unwrap(),
        vec![(key, Ok(Resolution::Fetched))]
    );
    assert_eq!(std::fs::read(local(&consumer, "mesh.fbx")).unwrap(), content);
}

#[test]
fn fetch_during_upload_never_sees_partial_file() {
    let mut cluster = Cluster::new(20);
    let content = patterned(5 * MIB, 0x33);
    let key = CacheKey::new("big.bin", "h1");
    let stored = cluster.server_dir().join("big.[h1].bin");
    let staged = cluster.server_dir().join(".big.[h1].bin.part");

    let mut uploader = cluster.client("uploader", "AssetCacheClient");
    std::fs::write(local(&uploader, "big.bin"), &content).unwrap();
    let uploaded = Results::default();
    uploader.publish(key.clone(), completion(&uploaded));

    // Tick until the server has opened the upload but holds no fragments yet.
    let mut opened = false;
    for _ in 0..100 {
        uploader.tick(STEP);
        cluster.network.pump();
        cluster.server.tick(STEP);
        cluster.network.pump();
        if staged.exists() {
            opened = true;
            break;
        }
    }
    assert!(opened, "upload never started");
    assert!(!stored.exists());

    let mut reader = cluster.client("reader", "AssetCacheClient");
    let fetched = Results::default();
    reader.fetch(key.clone(), completion(&fetched));
    cluster.run_until(&mut reader, &fetched, 1, STEP);

    assert_eq!(
        *fetched.lock().unwrap(),
        vec![(key.clone(), Err(RequestError::Unavailable))]
    );
    assert!(!local(&reader, "big.bin").exists());
    assert!(staged.exists());

    cluster.run_until(&mut uploader, &uploaded, 1, STEP);
    assert_eq!(
        *uploaded.lock().unwrap(),
        vec![(key.clone(), Ok(Resolution::Published))]
    );
    assert_eq!(std::fs::read(&stored).unwrap(), content);
    assert!(!staged.exists());

    reader.fetch(key.clone(), completion(&fetched));
    cluster.run_until(&mut reader, &fetched, 2, STEP);
    assert_eq!(fetched.lock().unwrap()[1], (key, Ok(Resolution::Fetched)));
    assert_eq!(std::fs::read(local(&reader, "big.bin")).unwrap(), content);
}

#[test]
fn concurrent_publishes_store_one_copy() {
    let mut cluster = Cluster::new(20);
    let content = patterned(2 * MIB + 5, 0x11);
    let key = CacheKey::new("shared.bin", "s1");

    let mut first = cluster.client("first", "AssetCacheClient");
    let mut second = cluster.client("second", "AssetCacheClient");
    std::fs::write(local(&first, "shared.bin"), &content).unwrap();
    std::fs::write(local(&second, "shared.bin"), &content).unwrap();

    let results = Results::default();
    first.publish(key.clone(), completion(&results));
    second.publish(key, completion(&results));
    for _ in 0..500 {
        first.tick(STEP);
        second.tick(STEP);
        cluster.network.pump();
        cluster.server.tick(STEP);
        cluster.network.pump();
        if results.lock().unwrap().len() >= 2 {
            break;
        }
    }

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    let published = results
        .iter()
        .filter(|(_, r)| *r == Ok(Resolution::Published))
        .count();
    assert_eq!(published, 1, "{results:?}");
    assert_eq!(
        std::fs::read(cluster.server_dir().join("shared.[s1].bin")).unwrap(),
        content
    );
    assert!(!cluster.server_dir().join(".shared.[s1].bin.part").exists());
}

#[test]
fn missing_artifact_is_unavailable() {
    let mut cluster = Cluster::new(10);
    let mut client = cluster.client("c", "AssetCacheClient");
    let results = Results::default();
    client.fetch(CacheKey::new("nothing.bin", "0"), completion(&results));
    cluster.run_until(&mut client, &results, 1, STEP);

    assert_eq!(results.lock().unwrap()[0].1, Err(RequestError::Unavailable));
    assert!(!local(&client, "nothing.bin").exists());
}

#[test]
fn second_publish_is_already_present() {
    let mut cluster = Cluster::new(10);
    let key = CacheKey::new("tex.png", "f00d");
    let mut client = cluster.client("c", "AssetCacheClient");
    std::fs::write(local(&client, "tex.png"), b"pixels").unwrap();

    let results = Results::default();
    client.publish(key.clone(), completion(&results));
    cluster.run_until(&mut client, &results, 1, STEP);
    client.publish(key.clone(), completion(&results));
    cluster.run_until(&mut client, &results, 2, STEP);

    let results = results.lock().unwrap();
    assert_eq!(results[0].1, Ok(Resolution::Published));
    assert_eq!(results[1].1, Ok(Resolution::AlreadyPresent));
}

#[test]
fn upload_evicts_least_recently_used() {
    let mut cluster = Cluster::new(10);
    let server_dir = cluster.server_dir();
    let old = server_dir.join("a.[1].bin");
    let newer = server_dir.join("b.[2].bin");
    for (path, secs) in [(&old, 1_000), (&newer, 2_000)] {
        std::fs::write(path, vec![0u8; 4 * MIB]).unwrap();
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    let key = CacheKey::new("c.bin", "3");
    let mut client = cluster.client("c", "AssetCacheClient");
    std::fs::write(local(&client, "c.bin"), patterned(3 * MIB, 1)).unwrap();
    let results = Results::default();
    client.publish(key, completion(&results));
    cluster.run_until(&mut client, &results, 1, STEP);

    assert_eq!(results.lock().unwrap()[0].1, Ok(Resolution::Published));
    assert!(!old.exists());
    assert!(newer.exists());
    assert!(server_dir.join("c.[3].bin").exists());
}

#[test]
fn wrong_identity_ends_unreachable() {
    let mut cluster = Cluster::new(10);
    let mut client = cluster.client("c", "Intruder");
    let results = Results::default();
    client.fetch(CacheKey::new("mesh.fbx", "1"), completion(&results));
    cluster.run_until(&mut client, &results, 1, Duration::from_secs(30));

    assert_eq!(
        results.lock().unwrap()[0].1,
        Err(RequestError::ServerUnreachable)
    );
    assert_eq!(cluster.server.peer_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_over_tcp() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let (tx, rx) = event::channel();
    let listener = TcpListenerTransport::bind("127.0.0.1:0".parse().unwrap(), tx, cancel.clone())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(listener.run());

    let server = CacheServer::new(
        ServerConfig {
            cache_dir: dir.path().join("server"),
            port,
            quota_mb: 10,
            ..ServerConfig::default()
        },
        rx,
    )
    .unwrap();
    let server_task = tokio::spawn(server.run(cancel.clone()));

    let local_dir = dir.path().join("local");
    std::fs::create_dir_all(&local_dir).unwrap();
    let content = patterned(2 * MIB + 5, 7);
    std::fs::write(local_dir.join("level.bin"), &content).unwrap();

    let config = CacheConfig {
        use_server: true,
        server_ip: "127.0.0.1".into(),
        server_port: port,
        local_cache_dir: local_dir.clone(),
        ..CacheConfig::default()
    };
    let mut manager = build_cache_manager(&config, tokio::runtime::Handle::current());
    let key = cache_key_for_file("level.bin", &local_dir.join("level.bin")).unwrap();
    let stored = dir.path().join("server").join(key.cache_file_name());
    let results = Results::default();

    manager.publish(key.clone(), completion(&results));
    for _ in 0..500 {
        manager.tick(Duration::from_millis(20));
        if !results.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(results.lock().unwrap()[0].1, Ok(Resolution::Published));
    assert_eq!(std::fs::read(&stored).unwrap(), content);

    std::fs::remove_file(local_dir.join("level.bin")).unwrap();
    manager.fetch(key.clone(), completion(&results));
    for _ in 0..500 {
        manager.tick(Duration::from_millis(20));
        if results.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(results.lock().unwrap()[1].1, Ok(Resolution::Fetched));
    assert_eq!(std::fs::read(local_dir.join("level.bin")).unwrap(), content);

    drop(manager);
    cancel.cancel();
    server_task.await.unwrap().unwrap();
}
