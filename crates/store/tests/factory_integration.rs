mod common;

use common::{MINUTE, T0, btc, config, open_times};
use footprint_core::common::TimeFrame;
use footprint_core::config::BackendKind;
use footprint_core::store::error::StoreError;
use footprint_core::store::port::{CandleAnalytics, CandleReader, CandleStore, FindOptions, SaveOutcome};
use footprint_store::{open_reader, open_store};
use tempfile::tempdir;

#[tokio::test]
async fn test_every_backend_honours_the_store_contract() {
    for backend in [BackendKind::AppendOnly, BackendKind::Relational, BackendKind::Block] {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.backend = backend;

        let store = open_store(&cfg).await.unwrap();
        let candles: Vec<_> = (0..3).map(|i| btc(T0 + i * MINUTE)).collect();
        let outcome = store.save_many(&candles).await.unwrap();
        assert_eq!(outcome.written, 3, "backend {}", backend);
        assert_eq!(store.save(&candles[0]).await.unwrap(), SaveOutcome::Duplicate, "backend {}", backend);

        let found = store
            .find_by_symbol("BTCUSDT", "binance", TimeFrame::Minute1, &FindOptions::all())
            .await
            .unwrap();
        assert_eq!(found, candles, "backend {}", backend);

        let windowed = store
            .find_by_symbol(
                "BTCUSDT",
                "binance",
                TimeFrame::Minute1,
                &FindOptions::range(T0 + MINUTE, T0 + 2 * MINUTE).with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(open_times(&windowed), vec![T0 + MINUTE], "backend {}", backend);

        let health = store.health_check().await.unwrap();
        assert!(health.healthy, "backend {}", backend);
        assert_eq!(health.backend, backend.to_string());

        store.flush().await.unwrap();
        store.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_reader_sees_relational_writes() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut cfg = config(dir.path());
    cfg.backend = BackendKind::Relational;

    let store = open_store(&cfg).await?;
    store.save(&btc(T0)).await?;

    let reader = open_reader(&cfg);
    let latest = reader.find_latest("BTCUSDT", "binance", TimeFrame::Minute1).await?;
    assert_eq!(latest, Some(btc(T0)));
    assert_eq!(reader.list_symbols(None).await?, vec!["BTCUSDT".to_string()]);
    assert!(matches!(reader.save(&btc(T0 + MINUTE)).await, Err(StoreError::ReadOnly)));
    Ok(())
}
