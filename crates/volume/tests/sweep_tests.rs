mod common;

use bytes::Bytes;
use cairn_volume::Volume;
use common::{foo_hash, make_volume, test_config, test_tuning, FOO_HASH};
use tokio_util::sync::CancellationToken;

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

fn hours(n: i64) -> time::Duration {
    time::Duration::hours(n)
}

#[tokio::test]
async fn sweep_deletes_expired_trash_and_its_marker() {
    let t = make_volume(test_config(), test_tuning());

    // recent/X is long past the signature TTL and trash/X past the trash
    // lifetime: both go.
    t.bucket.insert(&format!("recent/{FOO_HASH}"), b"");
    t.bucket.backdate(&format!("recent/{FOO_HASH}"), hours(25));
    t.bucket.insert(&format!("trash/{FOO_HASH}"), b"foo");
    t.bucket.backdate(&format!("trash/{FOO_HASH}"), hours(2));

    let stats = t.volume.empty_trash().await;

    assert_eq!(stats.blocks_in_trash, 1);
    assert_eq!(stats.bytes_in_trash, 3);
    assert_eq!(stats.blocks_deleted, 1);
    assert_eq!(stats.bytes_deleted, 3);
    assert!(!t.bucket.exists(&format!("trash/{FOO_HASH}")));
    assert!(!t.bucket.exists(&format!("recent/{FOO_HASH}")));
}

#[tokio::test]
async fn sweep_defers_trash_still_within_lifetime() {
    let t = make_volume(test_config(), test_tuning());

    t.bucket.insert(&format!("recent/{FOO_HASH}"), b"");
    t.bucket.backdate(&format!("recent/{FOO_HASH}"), hours(25));
    t.bucket.insert(&format!("trash/{FOO_HASH}"), b"foo");
    t.bucket
        .backdate(&format!("trash/{FOO_HASH}"), time::Duration::minutes(10));

    let stats = t.volume.empty_trash().await;

    assert_eq!(stats.blocks_in_trash, 1);
    assert_eq!(stats.blocks_deleted, 0);
    assert!(t.bucket.exists(&format!("trash/{FOO_HASH}")));
}

#[tokio::test]
async fn sweep_untrashes_orphan_trash_markers() {
    let t = make_volume(test_config(), test_tuning());

    // trash/X with no recent/X: an interrupted operation left an orphan.
    t.bucket.insert(&format!("trash/{FOO_HASH}"), b"foo");
    t.bucket.backdate(&format!("trash/{FOO_HASH}"), hours(2));

    let stats = t.volume.empty_trash().await;

    assert_eq!(stats.blocks_deleted, 0);
    assert_eq!(
        t.bucket.data(FOO_HASH).unwrap(),
        Bytes::from_static(b"foo")
    );
    assert!(t.bucket.exists(&format!("recent/{FOO_HASH}")));
}

#[tokio::test]
async fn sweep_restores_block_lost_to_recent_race() {
    let t = make_volume(test_config(), test_tuning());

    // Trashed within the signature TTL of its last touch, and the touch is
    // recent enough to still protect the block: restore the data object.
    t.bucket.insert(&format!("recent/{FOO_HASH}"), b"");
    t.bucket
        .backdate(&format!("recent/{FOO_HASH}"), time::Duration::minutes(30));
    t.bucket.insert(&format!("trash/{FOO_HASH}"), b"foo");
    t.bucket
        .backdate(&format!("trash/{FOO_HASH}"), time::Duration::minutes(29));

    let stats = t.volume.empty_trash().await;

    assert_eq!(stats.blocks_deleted, 0);
    assert_eq!(
        t.bucket.data(FOO_HASH).unwrap(),
        Bytes::from_static(b"foo")
    );
}

#[tokio::test]
async fn sweep_refreshes_block_with_stale_race_protection() {
    let t = make_volume(test_config(), test_tuning());

    // Race pattern (trashed within TTL of the touch), but the touch is
    // nearly as old as the TTL itself: deleting trash/X now would open a
    // window where the block could be re-trashed unprotected. The sweep
    // restores the block and refreshes its recency instead.
    t.bucket.insert(&format!("recent/{FOO_HASH}"), b"");
    t.bucket
        .backdate(&format!("recent/{FOO_HASH}"), time::Duration::seconds(59 * 60 + 30));
    t.bucket.insert(&format!("trash/{FOO_HASH}"), b"foo");
    t.bucket
        .backdate(&format!("trash/{FOO_HASH}"), time::Duration::minutes(30));

    let stats = t.volume.empty_trash().await;

    assert_eq!(stats.blocks_deleted, 0);
    assert_eq!(
        t.bucket.data(FOO_HASH).unwrap(),
        Bytes::from_static(b"foo")
    );
    // Touch rewrote the marker.
    let marker_age = time::OffsetDateTime::now_utc()
        - t.bucket
            .last_modified(&format!("recent/{FOO_HASH}"))
            .unwrap();
    assert!(marker_age < time::Duration::seconds(60));
}

#[tokio::test]
async fn sweep_skips_foreign_keys_in_trash() {
    let t = make_volume(test_config(), test_tuning());

    t.bucket.insert("trash/not-a-block-key", b"junk");

    let stats = t.volume.empty_trash().await;
    assert_eq!(stats.blocks_in_trash, 0);
    assert!(t.bucket.exists("trash/not-a-block-key"));
}

#[tokio::test]
async fn sweep_handles_many_blocks_with_worker_pool() {
    let mut config = test_config();
    config.empty_trash_workers = 4;
    let t = make_volume(config, test_tuning());

    let mut expired = 0u64;
    for i in 0..20u8 {
        let hash = cairn_core::locator::BlockHash::compute(&[i]).to_hex();
        t.bucket.insert(&format!("recent/{hash}"), b"");
        t.bucket.backdate(&format!("recent/{hash}"), hours(25));
        t.bucket.insert(&format!("trash/{hash}"), &[i]);
        if i % 2 == 0 {
            t.bucket.backdate(&format!("trash/{hash}"), hours(2));
            expired += 1;
        }
    }

    let stats = t.volume.empty_trash().await;
    assert_eq!(stats.blocks_in_trash, 20);
    assert_eq!(stats.blocks_deleted, expired);
}

#[tokio::test]
async fn trashed_block_survives_full_cycle() {
    let t = make_volume(test_config(), test_tuning());
    let loc = foo_hash();

    t.volume
        .put(&ctx(), &loc, Bytes::from_static(b"foo"))
        .await
        .unwrap();
    t.bucket.backdate(FOO_HASH, hours(24));
    t.bucket.backdate(&format!("recent/{FOO_HASH}"), hours(24));

    t.volume.trash(&loc).await.unwrap();
    // Not yet expired: the sweep must leave the trash copy alone so
    // untrash still works afterwards.
    let stats = t.volume.empty_trash().await;
    assert_eq!(stats.blocks_deleted, 0);

    t.volume.untrash(&loc).await.unwrap();
    assert_eq!(
        t.volume.get(&ctx(), &loc).await.unwrap(),
        Bytes::from_static(b"foo")
    );
}
