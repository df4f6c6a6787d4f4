use dsv_core::{
    DatasetRef, DsvConfig, Error, FsBlockStore, ListParams, Repo, SaveParams, load_commit,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open_repo(dir: &TempDir, peername: &str) -> Repo {
    let mut config = DsvConfig::default();
    config.profile.peername = peername.to_string();
    Repo::open(dir.path(), &config).unwrap()
}

#[test]
fn init_save_rename_remove() {
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&dir, "alice");
    let cats = DatasetRef::parse("alice/cats").unwrap();

    let h1 = repo
        .init(SaveParams::new(cats.clone()).body(b"[\"tabby\"]".to_vec()))
        .unwrap();
    let h1_path = h1.path.unwrap();
    assert_eq!(load_commit(repo.store().as_ref(), &h1_path).unwrap().prior, None);

    let h2 = repo
        .save(SaveParams::new(cats.clone()).body(b"[\"tabby\",\"calico\"]".to_vec()))
        .unwrap();
    let h2_path = h2.path.unwrap();
    assert_eq!(
        load_commit(repo.store().as_ref(), &h2_path).unwrap().prior,
        Some(h1_path)
    );

    let kittens = DatasetRef::parse("alice/kittens").unwrap();
    repo.rename(&cats, &kittens).unwrap();
    let (resolved, _) = repo.get(&kittens).unwrap();
    assert_eq!(resolved.path, Some(h2_path));

    repo.remove(&kittens).unwrap();
    assert!(repo.get(&kittens).unwrap_err().is_not_found());
    assert!(repo.remove(&kittens).unwrap_err().is_not_found());

    // Blocks outlive their index entry.
    let store = FsBlockStore::open(dir.path().join(dsv_core::BLOCKS_DIR)).unwrap();
    assert!(dsv_core::load_dataset(&store, &h2_path).is_ok());
}

#[test]
fn history_visits_every_head() {
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&dir, "alice");
    let cats = DatasetRef::new("me", "cats");

    let mut heads = vec![
        repo.init(SaveParams::new(cats.clone()).body(b"[0]".to_vec()))
            .unwrap()
            .path
            .unwrap(),
    ];
    for i in 1..6 {
        let body = format!("[{}]", i).into_bytes();
        heads.push(
            repo.save(SaveParams::new(cats.clone()).body(body))
                .unwrap()
                .path
                .unwrap(),
        );
    }

    let log = repo.log(&cats, None).unwrap();
    let mut walked: Vec<_> = log.iter().map(|e| e.path).collect();
    walked.reverse();
    assert_eq!(walked, heads);

    // Timestamps never run backwards along the chain.
    assert!(log.windows(2).all(|w| w[0].commit.timestamp >= w[1].commit.timestamp));
}

#[test]
fn index_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let repo = open_repo(&dir, "alice");
        for name in ["a", "b"] {
            repo.init(SaveParams::new(DatasetRef::new("alice", name)).body(b"[]".to_vec()))
                .unwrap();
        }
        repo.close().unwrap();
        assert!(matches!(
            repo.list(&ListParams::default()),
            Err(Error::IndexClosed)
        ));
    }

    let repo = open_repo(&dir, "alice");
    let names: Vec<_> = repo
        .list(&ListParams::default())
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, ["a", "b"]);
}

#[test]
fn concurrent_saves_on_disk() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(open_repo(&dir, "alice"));
    repo.init(SaveParams::new(DatasetRef::new("alice", "shared")).body(b"[0]".to_vec()))
        .unwrap();

    let handles: Vec<_> = (1..=4)
        .map(|i| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                let own = DatasetRef::new("alice", format!("own{}", i));
                repo.init(SaveParams::new(own).body(b"[]".to_vec())).unwrap();
                let body = format!("[{}]", i).into_bytes();
                repo.save(SaveParams::new(DatasetRef::new("alice", "shared")).body(body))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(repo.list(&ListParams::default()).unwrap().len(), 5);
    let log = repo
        .log(&DatasetRef::new("alice", "shared"), None)
        .unwrap();
    assert_eq!(log.len(), 5);
}
