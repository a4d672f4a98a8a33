//! Session-scoped cart.
//!
//! The cart lives in memory for the duration of a session and is mirrored to
//! a session-keyed document after every mutation. The mirror is best-effort:
//! a persistence failure is logged and never surfaced to the caller, because
//! losing the mirror costs nothing the user can't redo.

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::CartLine;

/// Line item as submitted by the caller; the line id is generated here.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCartLine {
    pub product_id: String,
    pub name: String,
    pub unit_price_minor: u64,
    pub quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CartDocument {
    #[serde(rename = "_id")]
    owner: String,
    lines: Vec<CartLine>,
}

#[async_trait]
pub trait CartPersistence: Send + Sync {
    async fn save(&self, owner: &str, lines: &[CartLine]) -> anyhow::Result<()>;
    async fn load(&self, owner: &str) -> anyhow::Result<Vec<CartLine>>;
}

/// Carts mirrored into the `carts` collection, one document per session key.
#[derive(Clone)]
pub struct MongoCartPersistence {
    carts: Collection<CartDocument>,
}

impl MongoCartPersistence {
    pub fn new(db: &Database) -> Self {
        Self {
            carts: db.collection("carts"),
        }
    }
}

#[async_trait]
impl CartPersistence for MongoCartPersistence {
    async fn save(&self, owner: &str, lines: &[CartLine]) -> anyhow::Result<()> {
        let document = CartDocument {
            owner: owner.to_string(),
            lines: lines.to_vec(),
        };
        self.carts
            .replace_one(
                doc! { "_id": owner },
                document,
                mongodb::options::ReplaceOptions::builder()
                    .upsert(true)
                    .build(),
            )
            .await?;
        Ok(())
    }

    async fn load(&self, owner: &str) -> anyhow::Result<Vec<CartLine>> {
        let document = self.carts.find_one(doc! { "_id": owner }, None).await?;
        Ok(document.map(|d| d.lines).unwrap_or_default())
    }
}

/// In-memory persistence for tests, with optional failure injection.
#[derive(Default)]
pub struct MemoryCartPersistence {
    saved: std::sync::Mutex<std::collections::HashMap<String, Vec<CartLine>>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryCartPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self) {
        self.fail_saves
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn saved_lines(&self, owner: &str) -> Option<Vec<CartLine>> {
        self.saved.lock().unwrap().get(owner).cloned()
    }
}

#[async_trait]
impl CartPersistence for MemoryCartPersistence {
    async fn save(&self, owner: &str, lines: &[CartLine]) -> anyhow::Result<()> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("injected cart persistence failure");
        }
        self.saved
            .lock()
            .unwrap()
            .insert(owner.to_string(), lines.to_vec());
        Ok(())
    }

    async fn load(&self, owner: &str) -> anyhow::Result<Vec<CartLine>> {
        Ok(self
            .saved
            .lock()
            .unwrap()
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }
}

/// The active cart for one session key.
pub struct CartStore {
    owner: String,
    lines: Vec<CartLine>,
    persistence: Arc<dyn CartPersistence>,
}

impl CartStore {
    pub fn new(owner: &str, persistence: Arc<dyn CartPersistence>) -> Self {
        Self {
            owner: owner.to_string(),
            lines: Vec::new(),
            persistence,
        }
    }

    /// Rehydrate the cart mirrored for `owner`; an unreadable mirror yields
    /// an empty cart rather than an error.
    pub async fn load(owner: &str, persistence: Arc<dyn CartPersistence>) -> Self {
        let lines = match persistence.load(owner).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(owner = %owner, error = %e, "failed to load persisted cart");
                Vec::new()
            }
        };
        Self {
            owner: owner.to_string(),
            lines,
            persistence,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Cart total in minor units. Derived, never stored.
    pub fn total(&self) -> u64 {
        self.lines
            .iter()
            .map(|l| l.unit_price_minor * u64::from(l.quantity))
            .sum()
    }

    /// Adds a line, merging quantity into an existing line for the same
    /// product so no two lines ever share a `product_id`.
    pub async fn add_item(&mut self, item: NewCartLine) {
        match self
            .lines
            .iter_mut()
            .find(|l| l.product_id == item.product_id)
        {
            Some(existing) => {
                existing.quantity += item.quantity;
            }
            None => {
                self.lines.push(CartLine {
                    id: uuid::Uuid::new_v4().to_string(),
                    product_id: item.product_id,
                    name: item.name,
                    unit_price_minor: item.unit_price_minor,
                    quantity: item.quantity,
                });
            }
        }
        self.persist().await;
    }

    /// No-op if the line is absent.
    pub async fn remove_item(&mut self, id: &str) {
        let before = self.lines.len();
        self.lines.retain(|l| l.id != id);
        if self.lines.len() != before {
            self.persist().await;
        }
    }

    /// Rejects quantities below one as a no-op.
    pub async fn set_quantity(&mut self, id: &str, quantity: u32) {
        if quantity < 1 {
            tracing::debug!(line_id = %id, quantity, "ignoring sub-minimum quantity");
            return;
        }
        if let Some(line) = self.lines.iter_mut().find(|l| l.id == id) {
            line.quantity = quantity;
            self.persist().await;
        }
    }

    pub async fn clear(&mut self) {
        self.lines.clear();
        self.persist().await;
    }

    async fn persist(&self) {
        if let Err(e) = self.persistence.save(&self.owner, &self.lines).await {
            tracing::warn!(owner = %self.owner, error = %e, "cart persistence failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(product_id: &str, unit_price_minor: u64, quantity: u32) -> NewCartLine {
        NewCartLine {
            product_id: product_id.to_string(),
            name: format!("Product {}", product_id),
            unit_price_minor,
            quantity,
        }
    }

    #[tokio::test]
    async fn adding_the_same_product_merges_quantities() {
        let persistence = Arc::new(MemoryCartPersistence::new());
        let mut cart = CartStore::new("user-1", persistence);

        cart.add_item(line("checkblock-windows", 100, 2)).await;
        cart.add_item(line("checkblock-windows", 100, 3)).await;

        assert_eq!(cart.lines().len(), 1);
        assert_eq!(cart.lines()[0].quantity, 5);
    }

    #[tokio::test]
    async fn total_is_the_sum_over_lines() {
        let persistence = Arc::new(MemoryCartPersistence::new());
        let mut cart = CartStore::new("user-1", persistence);

        cart.add_item(line("a", 100, 2)).await;
        cart.add_item(line("b", 250, 1)).await;

        assert_eq!(cart.total(), 450);
        // total() is derived, so calling it twice changes nothing.
        assert_eq!(cart.total(), 450);
    }

    #[tokio::test]
    async fn sub_minimum_quantity_is_rejected() {
        let persistence = Arc::new(MemoryCartPersistence::new());
        let mut cart = CartStore::new("user-1", persistence);

        cart.add_item(line("a", 100, 2)).await;
        let id = cart.lines()[0].id.clone();

        cart.set_quantity(&id, 0).await;
        assert_eq!(cart.lines()[0].quantity, 2);

        cart.set_quantity(&id, 7).await;
        assert_eq!(cart.lines()[0].quantity, 7);
    }

    #[tokio::test]
    async fn removing_an_absent_line_is_a_noop() {
        let persistence = Arc::new(MemoryCartPersistence::new());
        let mut cart = CartStore::new("user-1", persistence);

        cart.add_item(line("a", 100, 1)).await;
        cart.remove_item("missing").await;
        assert_eq!(cart.lines().len(), 1);
    }

    #[tokio::test]
    async fn persistence_failures_do_not_propagate() {
        let persistence = Arc::new(MemoryCartPersistence::new());
        persistence.fail_saves();
        let mut cart = CartStore::new("user-1", persistence.clone());

        // No panic, no error; the in-memory state still mutates.
        cart.add_item(line("a", 100, 1)).await;
        assert_eq!(cart.lines().len(), 1);
        assert!(persistence.saved_lines("user-1").is_none());
    }

    #[tokio::test]
    async fn mutations_mirror_the_full_line_list() {
        let persistence = Arc::new(MemoryCartPersistence::new());
        let mut cart = CartStore::new("user-1", persistence.clone());

        cart.add_item(line("a", 100, 1)).await;
        cart.add_item(line("b", 200, 2)).await;
        assert_eq!(persistence.saved_lines("user-1").unwrap().len(), 2);

        cart.clear().await;
        assert!(persistence.saved_lines("user-1").unwrap().is_empty());

        // A fresh store for the same owner sees the cleared state.
        let reloaded = CartStore::load("user-1", persistence).await;
        assert!(reloaded.is_empty());
    }
}
