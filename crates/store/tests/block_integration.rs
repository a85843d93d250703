mod common;

use common::{MINUTE, T0, btc, candle, config, open_times};
use footprint_core::common::{SeriesKey, TimeFrame};
use footprint_core::config::StoreConfig;
use footprint_core::store::port::{CandleReader, CandleStore, FindOptions, SaveOutcome};
use footprint_store::BlockStore;
use footprint_store::codec::frame::FRAME_HEADER_SIZE;
use std::path::Path;
use tempfile::tempdir;

fn block_config(dir: &Path, block_size: usize, max_cached_series: usize) -> StoreConfig {
    let mut cfg = config(dir);
    cfg.block.block_size = block_size;
    cfg.block.max_cached_series = max_cached_series;
    cfg
}

fn btc_key() -> SeriesKey {
    SeriesKey::new("binance", "BTCUSDT", TimeFrame::Minute1)
}

#[tokio::test]
async fn test_saved_candles_visible_before_flush() {
    let dir = tempdir().unwrap();
    let store = BlockStore::new(&config(dir.path())).unwrap();

    for i in 0..3 {
        assert_eq!(store.save(&btc(T0 + i * MINUTE)).await.unwrap(), SaveOutcome::Written);
    }
    assert_eq!(store.dirty_series().await, 1);
    assert!(!store.series_path(&btc_key()).exists());

    let found = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all())
        .await
        .unwrap();
    assert_eq!(open_times(&found), vec![T0, T0 + MINUTE, T0 + 2 * MINUTE]);
}

#[tokio::test]
async fn test_flush_persists_and_reloads() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let candles: Vec<_> = (0..5).map(|i| btc(T0 + i * MINUTE)).collect();

    {
        let store = BlockStore::new(&cfg).unwrap();
        let outcome = store.save_many(&candles).await.unwrap();
        assert_eq!(outcome.written, 5);
        store.flush().await.unwrap();
        assert_eq!(store.dirty_series().await, 0);
        assert!(store.series_path(&btc_key()).exists());
    }

    let store = BlockStore::new(&cfg).unwrap();
    let found = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all())
        .await
        .unwrap();
    assert_eq!(found, candles);

    let recent = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all().with_limit(2))
        .await
        .unwrap();
    assert_eq!(open_times(&recent), vec![T0 + 3 * MINUTE, T0 + 4 * MINUTE]);

    let latest = store.find_latest("BTCUSDT", "binance", TimeFrame::Minute1).await.unwrap();
    assert_eq!(latest, Some(candles[4].clone()));
}

#[tokio::test]
async fn test_pending_reaching_block_size_writes_file() {
    let dir = tempdir().unwrap();
    let store = BlockStore::new(&block_config(dir.path(), 3, 64)).unwrap();

    store.save(&btc(T0)).await.unwrap();
    store.save(&btc(T0 + MINUTE)).await.unwrap();
    assert!(!store.series_path(&btc_key()).exists());

    store.save(&btc(T0 + 2 * MINUTE)).await.unwrap();
    assert!(store.series_path(&btc_key()).exists());
    assert_eq!(store.dirty_series().await, 0);
}

#[tokio::test]
async fn test_duplicate_keeps_first_write() {
    let dir = tempdir().unwrap();
    let store = BlockStore::new(&config(dir.path())).unwrap();
    let original = btc(T0);
    let mut revised = btc(T0);
    revised.close += 10.0;

    assert_eq!(store.save(&original).await.unwrap(), SaveOutcome::Written);
    assert_eq!(store.save(&revised).await.unwrap(), SaveOutcome::Duplicate);

    let outcome = store.save_many(&[btc(T0), btc(T0 + MINUTE)]).await.unwrap();
    assert_eq!((outcome.written, outcome.duplicates, outcome.failed), (1, 1, 0));

    let latest = store.find_latest("BTCUSDT", "binance", TimeFrame::Minute1).await.unwrap();
    assert_eq!(latest.map(|c| c.open_time), Some(T0 + MINUTE));
    let found = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::range(T0, T0))
        .await
        .unwrap();
    assert_eq!(found, vec![original]);
}

#[tokio::test]
async fn test_eviction_persists_dirty_series() {
    let dir = tempdir().unwrap();
    let store = BlockStore::new(&block_config(dir.path(), 1000, 2)).unwrap();
    let eth = SeriesKey::new("binance", "ETHUSDT", TimeFrame::Minute1);

    store.save(&btc(T0)).await.unwrap();
    store
        .save(&candle("binance", "ETHUSDT", TimeFrame::Minute1, T0))
        .await
        .unwrap();
    assert!(!store.series_path(&btc_key()).exists());

    // 第三条序列挤出最久未访问的 BTCUSDT
    store.save(&candle("okx", "BTCUSDT", TimeFrame::Minute1, T0)).await.unwrap();
    assert_eq!(store.cached_series(), 2);
    assert!(store.series_path(&btc_key()).exists());
    assert!(!store.series_path(&eth).exists());

    let found = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all())
        .await
        .unwrap();
    assert_eq!(open_times(&found), vec![T0]);
    assert_eq!(store.cached_series(), 2);
}

#[tokio::test]
async fn test_close_flushes_dirty_series() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());

    let store = BlockStore::new(&cfg).unwrap();
    store.save(&btc(T0)).await.unwrap();
    store.close().await.unwrap();
    assert_eq!(store.cached_series(), 0);

    let reopened = BlockStore::new(&cfg).unwrap();
    let latest = reopened.find_latest("BTCUSDT", "binance", TimeFrame::Minute1).await.unwrap();
    assert_eq!(latest, Some(btc(T0)));
}

#[tokio::test]
async fn test_corrupt_block_on_disk_keeps_intact_entries() {
    let dir = tempdir().unwrap();
    let cfg = block_config(dir.path(), 2, 64);
    let path = {
        let store = BlockStore::new(&cfg).unwrap();
        let candles: Vec<_> = (0..4).map(|i| btc(T0 + i * MINUTE)).collect();
        store.save_many(&candles).await.unwrap();
        store.flush().await.unwrap();
        store.series_path(&btc_key())
    };

    // 文件头 16 字节；块帧 [magic][u32 len][u32 crc][u32 count][条目帧]...
    let mut bytes = tokio::fs::read(&path).await.unwrap();
    let first_len = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
    let second = 16 + FRAME_HEADER_SIZE + usize::try_from(first_len).unwrap();
    // 第二块第一条 K 线的负载
    bytes[second + FRAME_HEADER_SIZE + 4 + FRAME_HEADER_SIZE + 2] ^= 0xFF;
    tokio::fs::write(&path, &bytes).await.unwrap();

    let store = BlockStore::new(&cfg).unwrap();
    let found = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all())
        .await
        .unwrap();
    assert_eq!(open_times(&found), vec![T0, T0 + MINUTE, T0 + 3 * MINUTE]);
}

#[tokio::test]
async fn test_single_bad_byte_loses_only_one_candle() {
    let dir = tempdir().unwrap();
    let cfg = block_config(dir.path(), 100, 64);
    let path = {
        let store = BlockStore::new(&cfg).unwrap();
        for i in 0..3 {
            store.save(&btc(T0 + i * MINUTE)).await.unwrap();
        }
        store.close().await.unwrap();
        store.series_path(&btc_key())
    };

    // 整个序列只有一块，破坏最后一条 K 线负载的最后一个字节
    let mut bytes = tokio::fs::read(&path).await.unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    tokio::fs::write(&path, &bytes).await.unwrap();

    let store = BlockStore::new(&cfg).unwrap();
    let found = store
        .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all())
        .await
        .unwrap();
    assert_eq!(open_times(&found), vec![T0, T0 + MINUTE]);
}

#[tokio::test]
async fn test_invalid_candle_rejected_in_batch() {
    let dir = tempdir().unwrap();
    let store = BlockStore::new(&config(dir.path())).unwrap();
    let mut bad = btc(T0 + MINUTE);
    bad.is_complete = false;

    assert!(store.save(&bad).await.unwrap_err().is_validation());

    let outcome = store.save_many(&[btc(T0), bad, btc(T0 + 2 * MINUTE)]).await.unwrap();
    assert_eq!((outcome.written, outcome.duplicates, outcome.failed), (2, 0, 1));

    let health = store.health_check().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.backend, "block");
}
