//! 路径中 map 键的字符串驻留池。
//!
//! 编译后的字节码只保存 [`KeyId`]，求值时再解析回字符串；同一个键在所有路径之间共享一份存储。
//! 读多写少：写入只发生在编译期，求值期只读 `spin::RwLock` 保护的向量。

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// 驻留字符串的编号。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct KeyId(u32);

impl KeyId {
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// 线程安全的字符串驻留池。
#[derive(Debug, Default)]
pub struct PathStringPool {
    ids: DashMap<Arc<str>, KeyId>,
    strings: spin::RwLock<Vec<Arc<str>>>,
}

impl PathStringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 `key` 的编号；首次出现时分配新编号。相同内容总得到相同编号。
    pub fn intern(&self, key: &str) -> KeyId {
        if let Some(existing) = self.ids.get(key) {
            return *existing;
        }
        match self.ids.entry(Arc::from(key)) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let mut strings = self.strings.write();
                let id = KeyId(strings.len() as u32);
                strings.push(Arc::clone(entry.key()));
                entry.insert(id);
                id
            }
        }
    }

    /// 按编号取回字符串；未知编号返回 `None`。
    pub fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.strings.read().get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.strings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
