//! Build, persist and reload catalogs on disk.

use std::sync::Arc;

use exemplar_retrieval::{
    CatalogHandle, ExemplarStore, FlatL2Index, HashingProvider, IndexCatalog, Polarity,
    RetrievalEngine, RetrievalError, parse_knowledge_base,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const KNOWLEDGE_BASE: &str = r#"{
    "6": {
        "规则名称": "背板图配置",
        "正面示例": [
            {
                "sentence": "背板图缺少端口说明",
                "reference_sentence": "",
                "line_num": 12,
                "context": "{\"11\": \"上一行\", \"12\": \"背板图缺少端口说明\"}",
                "用户拒绝的建议": "甲",
                "用户拒绝的修改": "补充端口说明",
                "注意事项": "端口说明在附录中"
            },
            {
                "sentence": "背板图标注不清",
                "line_num": "20",
                "context": "",
                "用户拒绝的建议": "乙"
            }
        ],
        "反面示例": [
            {
                "sentence": "未给出背板图",
                "line_num": 31,
                "修改建议": "丙",
                "更改后示例": "增加背板图",
                "触发条件": "章节缺少背板图"
            }
        ]
    },
    "7": {
        "规则名称": "术语一致性",
        "正面示例": [],
        "反面示例": [
            {"sentence": "服务器/服务端混用", "line_num": 3, "修改建议": "统一术语"}
        ]
    }
}"#;

fn store() -> ExemplarStore {
    parse_knowledge_base(KNOWLEDGE_BASE).unwrap()
}

async fn built() -> IndexCatalog {
    IndexCatalog::build(store(), &HashingProvider::new(32))
        .await
        .unwrap()
}

fn vectors(index: &FlatL2Index) -> Vec<Vec<f32>> {
    index.vectors().map(<[f32]>::to_vec).collect()
}

async fn engine_for(catalog: IndexCatalog) -> RetrievalEngine {
    let handle = CatalogHandle::new();
    handle.swap(catalog).await;
    RetrievalEngine::new(handle, Arc::new(HashingProvider::new(32)))
}

#[tokio::test]
async fn test_save_then_load_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");

    let original = built().await;
    original.save(&target).await.unwrap();

    assert!(target.join("exemplars.json").is_file());
    assert!(target.join("rule_6").join("positive.index").is_file());
    assert!(target.join("rule_7").join("negative.index").is_file());
    assert!(!temp_dir.path().join("vector_db.staging").exists());

    let loaded = IndexCatalog::load(&target).await.unwrap();

    assert_eq!(
        loaded.rule_ids().collect::<Vec<_>>(),
        original.rule_ids().collect::<Vec<_>>()
    );
    assert_eq!(loaded.summaries(), original.summaries());
    assert_eq!(loaded.dimension(), 32);
    assert_eq!(loaded.store(), original.store());

    for rule_id in ["6", "7"] {
        let before = original.lookup(rule_id).unwrap();
        let after = loaded.lookup(rule_id).unwrap();
        for polarity in Polarity::ALL {
            let expected: Vec<Vec<u32>> = vectors(before.indices.index(polarity))
                .iter()
                .map(|v| v.iter().map(|x| x.to_bits()).collect())
                .collect();
            let actual: Vec<Vec<u32>> = vectors(after.indices.index(polarity))
                .iter()
                .map(|v| v.iter().map(|x| x.to_bits()).collect())
                .collect();
            assert_eq!(actual, expected, "rule {rule_id} {polarity}");
        }
    }
}

#[tokio::test]
async fn test_save_replaces_existing_catalog() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");

    built().await.save(&target).await.unwrap();

    let mut smaller = store();
    smaller.retain(|rule_id| rule_id == "7");
    let replacement = IndexCatalog::build(smaller, &HashingProvider::new(32))
        .await
        .unwrap();
    replacement.save(&target).await.unwrap();

    let loaded = IndexCatalog::load(&target).await.unwrap();
    assert_eq!(loaded.rule_ids().collect::<Vec<_>>(), vec!["7"]);
    assert!(!target.join("rule_6").exists());
    assert!(!temp_dir.path().join("vector_db.previous").exists());
}

#[tokio::test]
async fn test_failed_save_keeps_previous_catalog() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");
    built().await.save(&target).await.unwrap();

    // A plain file where the staging directory should go makes the save fail.
    std::fs::write(temp_dir.path().join("vector_db.staging"), b"blocked").unwrap();

    let mut smaller = store();
    smaller.retain(|rule_id| rule_id == "7");
    let replacement = IndexCatalog::build(smaller, &HashingProvider::new(32))
        .await
        .unwrap();
    assert!(replacement.save(&target).await.is_err());

    let loaded = IndexCatalog::load(&target).await.unwrap();
    assert_eq!(loaded.rule_ids().collect::<Vec<_>>(), vec!["6", "7"]);
}

#[tokio::test]
async fn test_load_skips_rule_without_index_directory() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");
    built().await.save(&target).await.unwrap();

    std::fs::remove_dir_all(target.join("rule_7")).unwrap();

    let loaded = IndexCatalog::load(&target).await.unwrap();
    assert_eq!(loaded.rule_ids().collect::<Vec<_>>(), vec!["6"]);
    assert!(!loaded.contains("7"));
    assert!(loaded.store().rule("7").is_none());
    assert!(matches!(
        loaded.lookup("7"),
        Err(RetrievalError::UnknownRule(_))
    ));
}

#[tokio::test]
async fn test_load_skips_rule_with_missing_index_file() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");
    built().await.save(&target).await.unwrap();

    std::fs::remove_file(target.join("rule_7").join("negative.index")).unwrap();

    let loaded = IndexCatalog::load(&target).await.unwrap();
    assert_eq!(loaded.rule_ids().collect::<Vec<_>>(), vec!["6"]);
    assert!(loaded.store().rule("7").is_none());
}

#[tokio::test]
async fn test_load_falls_back_to_previous_catalog() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");
    built().await.save(&target).await.unwrap();

    // State between moving the old catalog aside and renaming the new one in.
    std::fs::rename(&target, temp_dir.path().join("vector_db.previous")).unwrap();

    let loaded = IndexCatalog::load(&target).await.unwrap();
    assert_eq!(loaded.rule_ids().collect::<Vec<_>>(), vec!["6", "7"]);
    assert_eq!(loaded.dimension(), 32);
}

#[tokio::test]
async fn test_load_missing_catalog_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let result = IndexCatalog::load(temp_dir.path().join("absent")).await;
    assert!(matches!(result, Err(RetrievalError::NotFound(_))));
}

#[tokio::test]
async fn test_load_rejects_corrupt_index() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");
    built().await.save(&target).await.unwrap();

    std::fs::write(target.join("rule_6").join("positive.index"), b"XFLT").unwrap();

    assert!(matches!(
        IndexCatalog::load(&target).await,
        Err(RetrievalError::CorruptIndex { .. })
    ));
}

#[tokio::test]
async fn test_extra_index_vectors_are_dropped_at_query_time() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("vector_db");
    let catalog = built().await;
    catalog.save(&target).await.unwrap();

    // Three vectors for two positive exemplars.
    let mut skewed = catalog.lookup("6").unwrap().indices.positive.clone();
    let extra = skewed.vector(0).unwrap().to_vec();
    skewed.add(&extra).unwrap();
    skewed
        .write_to(target.join("rule_6").join("positive.index"))
        .await
        .unwrap();

    let loaded = IndexCatalog::load(&target).await.unwrap();
    assert_eq!(loaded.lookup("6").unwrap().indices.positive.len(), 3);

    let engine = engine_for(loaded).await;
    let results = engine.retrieve("6", "甲", 10).await.unwrap();
    assert_eq!(results.positive.len(), 2);
    assert_eq!(results.negative.len(), 1);
}
