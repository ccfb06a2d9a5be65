//! Differential payload computation.
//!
//! Baselines and current views are compared as JSON trees so one diff walk
//! covers every entity type. Per-category rules:
//! - mapping categories (market_data, order_book, positions, strategies):
//!   per-key field diff; a key absent from the new view becomes `null`;
//! - orders (small-N ordered sequence): resent whole when anything changed;
//! - account (singleton): changed top-level fields only.

use serde_json::{Map, Value};

use crate::models::{Category, StateView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CategoryKind {
    Mapping,
    Sequence,
    Singleton,
}

fn kind_of(category: Category) -> CategoryKind {
    match category {
        Category::MarketData
        | Category::OrderBook
        | Category::Positions
        | Category::Strategies => CategoryKind::Mapping,
        Category::Orders => CategoryKind::Sequence,
        Category::Account => CategoryKind::Singleton,
    }
}

/// Serialize the categories present in a view, keyed by category name.
pub fn view_payload(view: &StateView) -> Map<String, Value> {
    let mut payload = Map::new();

    fn put<T: serde::Serialize>(payload: &mut Map<String, Value>, category: Category, v: &T) {
        if let Ok(value) = serde_json::to_value(v) {
            payload.insert(category.as_str().to_string(), value);
        }
    }

    if let Some(md) = &view.market_data {
        put(&mut payload, Category::MarketData, md.as_ref());
    }
    if let Some(books) = &view.order_books {
        put(&mut payload, Category::OrderBook, books.as_ref());
    }
    if let Some(orders) = &view.orders {
        put(&mut payload, Category::Orders, orders.as_ref());
    }
    if let Some(positions) = &view.positions {
        put(&mut payload, Category::Positions, positions.as_ref());
    }
    if let Some(account) = &view.account {
        put(&mut payload, Category::Account, account.as_ref());
    }
    if let Some(strategies) = &view.strategies {
        put(&mut payload, Category::Strategies, strategies.as_ref());
    }

    payload
}

/// Minimal changes evolving `baseline` into `current`. Empty result means
/// nothing a subscriber can see has changed.
pub fn diff_payload(
    baseline: &Map<String, Value>,
    current: &Map<String, Value>,
) -> Map<String, Value> {
    let mut changes = Map::new();

    for (name, new_value) in current {
        let Some(category) = Category::from_str(name) else {
            continue;
        };

        let Some(old_value) = baseline.get(name) else {
            // No baseline for this category: send it whole.
            changes.insert(name.clone(), new_value.clone());
            continue;
        };

        let delta = match kind_of(category) {
            CategoryKind::Mapping => diff_mapping(old_value, new_value),
            CategoryKind::Sequence => (old_value != new_value).then(|| new_value.clone()),
            CategoryKind::Singleton => diff_object(old_value, new_value),
        };

        if let Some(delta) = delta {
            changes.insert(name.clone(), delta);
        }
    }

    changes
}

/// Per-key diff of a keyed mapping. Removed keys map to `null`.
fn diff_mapping(old: &Value, new: &Value) -> Option<Value> {
    let (Some(old_map), Some(new_map)) = (old.as_object(), new.as_object()) else {
        return (old != new).then(|| new.clone());
    };

    let mut out = Map::new();

    for (key, new_entry) in new_map {
        match old_map.get(key) {
            None => {
                out.insert(key.clone(), new_entry.clone());
            }
            Some(old_entry) => {
                if let Some(delta) = diff_object(old_entry, new_entry) {
                    out.insert(key.clone(), delta);
                }
            }
        }
    }

    for key in old_map.keys() {
        if !new_map.contains_key(key) {
            out.insert(key.clone(), Value::Null);
        }
    }

    (!out.is_empty()).then(|| Value::Object(out))
}

/// Field-level diff of two objects: fields of `new` whose values differ.
fn diff_object(old: &Value, new: &Value) -> Option<Value> {
    let (Some(old_obj), Some(new_obj)) = (old.as_object(), new.as_object()) else {
        return (old != new).then(|| new.clone());
    };

    let mut out = Map::new();
    for (field, new_value) in new_obj {
        if old_obj.get(field) != Some(new_value) {
            out.insert(field.clone(), new_value.clone());
        }
    }

    (!out.is_empty()).then(|| Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn changed_fields_only_for_mappings() {
        let baseline = as_map(json!({
            "market_data": {
                "BTCUSDT": { "last": 50000.0, "bid": 49999.0, "ask": 50001.0 }
            }
        }));
        let current = as_map(json!({
            "market_data": {
                "BTCUSDT": { "last": 50010.0, "bid": 49999.0, "ask": 50001.0 }
            }
        }));

        let changes = diff_payload(&baseline, &current);
        assert_eq!(
            Value::Object(changes),
            json!({ "market_data": { "BTCUSDT": { "last": 50010.0 } } })
        );
    }

    #[test]
    fn removed_keys_become_null() {
        let baseline = as_map(json!({
            "positions": { "BTCUSDT": { "size": 1.0 }, "ETHUSDT": { "size": 2.0 } }
        }));
        let current = as_map(json!({
            "positions": { "BTCUSDT": { "size": 1.0 } }
        }));

        let changes = diff_payload(&baseline, &current);
        assert_eq!(
            Value::Object(changes),
            json!({ "positions": { "ETHUSDT": null } })
        );
    }

    #[test]
    fn new_keys_sent_whole() {
        let baseline = as_map(json!({ "market_data": {} }));
        let current = as_map(json!({
            "market_data": { "SOLUSDT": { "last": 95.0, "bid": 94.9 } }
        }));

        let changes = diff_payload(&baseline, &current);
        assert_eq!(
            Value::Object(changes),
            json!({ "market_data": { "SOLUSDT": { "last": 95.0, "bid": 94.9 } } })
        );
    }

    #[test]
    fn orders_resent_whole_on_any_change() {
        let baseline = as_map(json!({
            "orders": [ { "id": "o1", "status": "new" }, { "id": "o2", "status": "new" } ]
        }));
        let current = as_map(json!({
            "orders": [ { "id": "o1", "status": "filled" }, { "id": "o2", "status": "new" } ]
        }));

        let changes = diff_payload(&baseline, &current);
        assert_eq!(changes["orders"], current["orders"]);
    }

    #[test]
    fn account_diffs_top_level_fields() {
        let baseline = as_map(json!({
            "account": { "total_equity": 1000.0, "available_margin": 400.0 }
        }));
        let current = as_map(json!({
            "account": { "total_equity": 1010.0, "available_margin": 400.0 }
        }));

        let changes = diff_payload(&baseline, &current);
        assert_eq!(
            Value::Object(changes),
            json!({ "account": { "total_equity": 1010.0 } })
        );
    }

    #[test]
    fn identical_views_produce_empty_diff() {
        let payload = as_map(json!({
            "market_data": { "BTCUSDT": { "last": 1.0 } },
            "orders": [ { "id": "o1" } ],
            "account": { "total_equity": 5.0 }
        }));
        assert!(diff_payload(&payload, &payload).is_empty());
    }

    #[test]
    fn category_without_baseline_sent_whole() {
        let baseline = Map::new();
        let current = as_map(json!({ "account": { "total_equity": 5.0 } }));
        let changes = diff_payload(&baseline, &current);
        assert_eq!(changes["account"], current["account"]);
    }
}
