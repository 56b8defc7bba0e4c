//! Граф API и реализация

pub mod engine;
pub mod id_gen;
pub mod traversal;

pub use engine::GraphEngine;
pub use id_gen::{compute_edge_key, compute_node_id, string_id_to_u128};

use crate::error::Result;
use crate::storage::compaction::CompactionResult;
use crate::storage::multi_shard::{Delta, FlushReport, UnitRecords};
use crate::storage::{AttrQuery, Direction, EdgeRecord, NodeRecord, UpsertStats};

/// Основной trait для graph storage
///
/// Все методы берут `&self`: движок потокобезопасен, параллельные
/// writers разных файлов не мешают друг другу.
pub trait GraphStore {
    // === NODE OPERATIONS ===

    /// Добавить ноды batch'ом. `shard_key` - путь файла-источника;
    /// пустой `owner` у записей заполняется им.
    fn upsert_batch(&self, shard_key: &str, nodes: Vec<NodeRecord>) -> Result<UpsertStats>;

    /// Удалить ноду вместе с её входящими и исходящими рёбрами
    fn delete_node(&self, id: u128) -> Result<bool>;

    /// Получить ноду по ID
    fn get_node(&self, id: u128) -> Result<Option<NodeRecord>>;

    /// Проверить существование ноды
    fn node_exists(&self, id: u128) -> Result<bool> {
        Ok(self.get_node(id)?.is_some())
    }

    /// Найти ноды по атрибутам (kind поддерживает wildcard, e.g., "http:*")
    fn find_nodes(&self, query: &AttrQuery) -> Result<Vec<NodeRecord>>;

    // === EDGE OPERATIONS ===

    /// Добавить рёбра batch'ом
    fn upsert_edges(&self, shard_key: &str, edges: Vec<EdgeRecord>) -> Result<UpsertStats>;

    /// Удалить ребро
    fn delete_edge(&self, src: u128, dst: u128, kind: &str) -> Result<bool>;

    /// Рёбра ноды в заданном направлении вместе с нодой на другом конце
    fn neighbors(&self, id: u128, direction: Direction, kinds: Option<&[&str]>) -> Result<Vec<(EdgeRecord, u128)>>;

    // === INCREMENTAL ===

    /// Заменить все записи unit'а (файла) новым набором, вернуть diff
    fn reanalyze_unit(&self, unit_key: &str, records: UnitRecords) -> Result<Delta>;

    // === TRAVERSAL ===

    /// BFS от start нод до глубины max_depth по указанным типам рёбер
    fn bfs(&self, start: &[u128], max_depth: usize, kinds: Option<&[&str]>) -> Result<Vec<u128>> {
        traversal::bfs(start, max_depth, None, |id| {
            Ok(self
                .neighbors(id, Direction::Outgoing, kinds)?
                .into_iter()
                .map(|(_, dst)| dst)
                .collect())
        })
    }

    // === MAINTENANCE ===

    /// Сбросить буферы всех шардов в L0 сегменты
    fn flush(&self) -> Result<FlushReport>;

    /// Компактировать шарды, выбранные политикой
    fn compact(&self) -> Result<CompactionResult>;
}
