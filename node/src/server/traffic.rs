//! 用户流量计数
//!
//! 数据面按用户标签累加上下行字节，控制面在每个上报周期读取并清零。
//! 读取与清零通过原子 swap 完成，周期边界上不会丢失或重复计数。

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 单个用户的上下行计数
#[derive(Debug, Default)]
pub struct TrafficStorage {
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrafficStorage {
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Acquire)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Acquire)
    }

    pub fn add_upload(&self, n: u64) {
        self.upload.fetch_add(n, Ordering::AcqRel);
    }

    pub fn add_download(&self, n: u64) {
        self.download.fetch_add(n, Ordering::AcqRel);
    }

    /// 清零并返回清零前的 (上行, 下行)
    pub fn take(&self) -> (u64, u64) {
        (
            self.upload.swap(0, Ordering::AcqRel),
            self.download.swap(0, Ordering::AcqRel),
        )
    }
}

/// 一个节点内按用户标签索引的流量计数器
#[derive(Debug, Default)]
pub struct TrafficCounter {
    counters: DashMap<String, Arc<TrafficStorage>>,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取计数，不存在时创建
    ///
    /// 并发创建时只有一个对象会被插入，所有调用方拿到同一个实例。
    pub fn get(&self, tag: &str) -> Arc<TrafficStorage> {
        if let Some(storage) = self.counters.get(tag) {
            return storage.value().clone();
        }
        self.counters
            .entry(tag.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn add_upload(&self, tag: &str, n: u64) {
        self.get(tag).add_upload(n);
    }

    pub fn add_download(&self, tag: &str, n: u64) {
        self.get(tag).add_download(n);
    }

    /// 清零指定用户的计数，返回清零前的值
    pub fn reset(&self, tag: &str) -> (u64, u64) {
        match self.counters.get(tag) {
            Some(storage) => storage.take(),
            None => (0, 0),
        }
    }

    pub fn delete(&self, tag: &str) {
        self.counters.remove(tag);
    }

    pub fn count(&self) -> usize {
        self.counters.len()
    }

    /// 取出上下行合计超过 `threshold` 字节的用户流量并清零
    ///
    /// 未超过阈值的计数保持不变，在后续周期继续累积。
    pub fn drain_over(&self, threshold: u64) -> Vec<(String, u64, u64)> {
        let mut drained = Vec::new();
        for entry in self.counters.iter() {
            let storage = entry.value();
            if storage.upload() + storage.download() <= threshold {
                continue;
            }
            let (up, down) = storage.take();
            if up + down > 0 {
                drained.push((entry.key().clone(), up, down));
            }
        }
        drained
    }
}

/// 以节点标签为键的流量计数器注册表
///
/// 由 Core 独占持有，同时交给引擎用于数据面记账。
#[derive(Debug, Default, Clone)]
pub struct TrafficRegistry {
    counters: Arc<DashMap<String, Arc<TrafficCounter>>>,
}

impl TrafficRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取节点的计数器，不存在时创建
    pub fn counter(&self, node_tag: &str) -> Arc<TrafficCounter> {
        if let Some(counter) = self.counters.get(node_tag) {
            return counter.value().clone();
        }
        self.counters
            .entry(node_tag.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// 仅查询，不创建
    pub fn existing(&self, node_tag: &str) -> Option<Arc<TrafficCounter>> {
        self.counters.get(node_tag).map(|c| c.value().clone())
    }

    pub fn remove(&self, node_tag: &str) {
        self.counters.remove(node_tag);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }
}
