//! 仓位持久化
//! 每个仓位一个JSON文件（仓位状态 + 其全部订单记录），
//! 先写临时文件再原子重命名，崩溃时磁盘上要么是旧的完整快照
//! 要么是新的完整快照，写了一半的文件不会被当作有效数据加载。

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::engine::ledger::OrderRecord;
use crate::engine::position::Position;

/// 落盘的仓位快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPosition {
    pub position: Position,
    pub orders: Vec<OrderRecord>,
}

/// 仓位存储
pub struct PositionStore {
    dir: PathBuf,
}

impl PositionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, position_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", position_id))
    }

    /// 保存仓位快照（每次已提交的状态变更后调用）
    pub fn save(&self, position: &Position, orders: &[OrderRecord]) -> Result<()> {
        let snapshot = PersistedPosition {
            position: position.clone(),
            orders: orders.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let path = self.path_for(&position.id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", position.id));

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// 启动时加载全部仓位快照，损坏的文件跳过并告警
    pub fn load_all(&self) -> Result<Vec<PersistedPosition>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match fs::read(&path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("⚠️ 读取仓位快照 {:?} 失败，跳过: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_slice::<PersistedPosition>(&contents) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    log::warn!("⚠️ 仓位快照 {:?} 无法解析，跳过: {}", path, e);
                }
            }
        }
        Ok(snapshots)
    }

    /// 归档时删除快照文件
    pub fn remove(&self, position_id: &str) -> Result<()> {
        let path = self.path_for(position_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PositionSide, PositionSpec, TpLevel};

    fn temp_store() -> PositionStore {
        let dir = std::env::temp_dir().join(format!(
            "rustpos-store-{}-{:x}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        PositionStore::new(dir).unwrap()
    }

    fn sample_position(id: &str) -> Position {
        Position::new(
            id.to_string(),
            PositionSpec {
                symbol: "ETH/USDT".to_string(),
                side: PositionSide::Short,
                quantity: 10.0,
                entry_price: Some(2000.0),
                leverage: 3,
                tp_levels: vec![TpLevel {
                    price_offset_pct: 3.0,
                    close_pct: 100.0,
                }],
                stop_price: 2100.0,
            },
        )
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = temp_store();
        let mut position = sample_position("POS-rt");
        position.mark_entry_filled(10.0, Some(1999.5));
        store.save(&position, &[]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[0].position;
        assert_eq!(restored.id, "POS-rt");
        assert!(restored.entry_filled);
        assert_eq!(restored.entry_fill_price, Some(1999.5));
        assert_eq!(restored.state, position.state);
    }

    #[test]
    fn test_corrupt_snapshot_skipped() {
        let store = temp_store();
        let position = sample_position("POS-ok");
        store.save(&position, &[]).unwrap();

        // 模拟写了一半的文件
        fs::write(store.dir.join("POS-bad.json"), b"{\"position\": {\"id\": \"POS").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].position.id, "POS-ok");
    }

    #[test]
    fn test_tmp_files_ignored_on_load() {
        let store = temp_store();
        fs::write(store.dir.join("POS-x.json.tmp"), b"not json").unwrap();
        let loaded = store.load_all().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let store = temp_store();
        let mut position = sample_position("POS-ow");
        store.save(&position, &[]).unwrap();
        position.mark_entry_filled(10.0, Some(2001.0));
        store.save(&position, &[]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].position.entry_filled);
    }

    #[test]
    fn test_remove_deletes_snapshot() {
        let store = temp_store();
        let position = sample_position("POS-rm");
        store.save(&position, &[]).unwrap();
        store.remove("POS-rm").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
