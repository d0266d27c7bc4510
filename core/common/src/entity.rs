//! Business entity payloads.
//!
//! Each entity type has an explicit field set. Payloads arriving from the
//! remote authority are decoded against that field set and rejected on any
//! mismatch instead of being passed through untyped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::EntityType;
use crate::{Error, Result};

/// A stock-keeping item. Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryItem {
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub stock: i64,
    pub unit_price: i64,
    #[serde(default)]
    pub cost_price: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Sale,
    Purchase,
    Expense,
    Refund,
}

/// A money movement recorded at the point of sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub amount: i64,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivableStatus {
    Open,
    PartiallyPaid,
    Paid,
}

/// Money owed by a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Receivable {
    pub contact_id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    pub status: ReceivableStatus,
    #[serde(default)]
    pub note: Option<String>,
}

impl Receivable {
    /// Outstanding balance.
    pub fn balance(&self) -> i64 {
        self.amount - self.amount_paid
    }

    /// Apply a payment and recompute the status.
    ///
    /// # Errors
    /// - Amount is not positive
    /// - Payment exceeds the outstanding balance
    pub fn apply_payment(&mut self, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(Error::InvalidInput("Payment amount must be positive".to_string()));
        }
        if amount > self.balance() {
            return Err(Error::InvalidInput(format!(
                "Payment of {} exceeds outstanding balance of {}",
                amount,
                self.balance()
            )));
        }
        self.amount_paid += amount;
        self.status = Self::status_for(self.amount, self.amount_paid);
        Ok(())
    }

    fn status_for(amount: i64, paid: i64) -> ReceivableStatus {
        if paid >= amount {
            ReceivableStatus::Paid
        } else if paid > 0 {
            ReceivableStatus::PartiallyPaid
        } else {
            ReceivableStatus::Open
        }
    }
}

/// A double-entry bookkeeping line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEntry {
    pub account_code: String,
    #[serde(default)]
    pub debit: i64,
    #[serde(default)]
    pub credit: i64,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Customer,
    Supplier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Contact {
    pub name: String,
    pub kind: ContactKind,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Domain fields of a record, one variant per entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPayload {
    Inventory(InventoryItem),
    Transaction(Transaction),
    Receivable(Receivable),
    LedgerEntry(LedgerEntry),
    Contact(Contact),
}

impl EntityPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Inventory(_) => EntityType::Inventory,
            EntityPayload::Transaction(_) => EntityType::Transaction,
            EntityPayload::Receivable(_) => EntityType::Receivable,
            EntityPayload::LedgerEntry(_) => EntityType::LedgerEntry,
            EntityPayload::Contact(_) => EntityType::Contact,
        }
    }

    /// Decode the field set of `entity_type` from JSON.
    ///
    /// # Errors
    /// - `MalformedPayload` if the JSON does not match the field set
    pub fn decode(
        entity_type: EntityType,
        record_id: &str,
        value: serde_json::Value,
    ) -> Result<Self> {
        let decoded = match entity_type {
            EntityType::Inventory => serde_json::from_value(value).map(EntityPayload::Inventory),
            EntityType::Transaction => {
                serde_json::from_value(value).map(EntityPayload::Transaction)
            }
            EntityType::Receivable => serde_json::from_value(value).map(EntityPayload::Receivable),
            EntityType::LedgerEntry => {
                serde_json::from_value(value).map(EntityPayload::LedgerEntry)
            }
            EntityType::Contact => serde_json::from_value(value).map(EntityPayload::Contact),
        };

        decoded.map_err(|e| Error::MalformedPayload {
            entity_type,
            record_id: record_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode from a JSON string (used for locally persisted payloads).
    pub fn from_json(entity_type: EntityType, record_id: &str, json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::decode(entity_type, record_id, value)
    }

    /// Encode the field set as JSON.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            EntityPayload::Inventory(p) => serde_json::to_value(p),
            EntityPayload::Transaction(p) => serde_json::to_value(p),
            EntityPayload::Receivable(p) => serde_json::to_value(p),
            EntityPayload::LedgerEntry(p) => serde_json::to_value(p),
            EntityPayload::Contact(p) => serde_json::to_value(p),
        };
        Ok(value?)
    }

    /// Canonical JSON text. Field order is fixed by the struct
    /// definitions, so equal payloads always encode to identical bytes.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Enforce the rules a local write must satisfy.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidInput(msg.to_string()));
        match self {
            EntityPayload::Inventory(item) => {
                if item.name.trim().is_empty() {
                    return invalid("Inventory item name cannot be empty");
                }
                if item.unit_price < 0 || item.cost_price.is_some_and(|c| c < 0) {
                    return invalid("Prices cannot be negative");
                }
            }
            EntityPayload::Transaction(tx) => {
                if tx.amount < 0 {
                    return invalid("Transaction amount cannot be negative");
                }
            }
            EntityPayload::Receivable(r) => {
                if r.contact_id.trim().is_empty() {
                    return invalid("Receivable must reference a contact");
                }
                if r.amount < 0 || r.amount_paid < 0 {
                    return invalid("Receivable amounts cannot be negative");
                }
                if r.amount_paid > r.amount {
                    return invalid("Amount paid exceeds amount owed");
                }
            }
            EntityPayload::LedgerEntry(entry) => {
                if entry.account_code.trim().is_empty() {
                    return invalid("Ledger entry needs an account code");
                }
                if entry.debit < 0 || entry.credit < 0 {
                    return invalid("Ledger amounts cannot be negative");
                }
                if (entry.debit > 0) == (entry.credit > 0) {
                    return invalid("Ledger entry must have exactly one of debit or credit");
                }
            }
            EntityPayload::Contact(contact) => {
                if contact.name.trim().is_empty() {
                    return invalid("Contact name cannot be empty");
                }
            }
        }
        Ok(())
    }

    /// Top-level field names whose values differ between two payloads.
    pub fn changed_fields(&self, other: &EntityPayload) -> Vec<String> {
        let (Ok(a), Ok(b)) = (self.to_value(), other.to_value()) else {
            return Vec::new();
        };
        match (a, b) {
            (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
                let mut fields: Vec<String> = a
                    .iter()
                    .filter(|(k, v)| b.get(k.as_str()) != Some(v))
                    .map(|(k, _)| k.clone())
                    .chain(b.keys().filter(|k| !a.contains_key(k.as_str())).cloned())
                    .collect();
                fields.sort();
                fields
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(stock: i64) -> EntityPayload {
        EntityPayload::Inventory(InventoryItem {
            name: "Rice 5kg".into(),
            sku: Some("RICE-5".into()),
            category: None,
            stock,
            unit_price: 4500,
            cost_price: None,
        })
    }

    #[test]
    fn test_decode_valid_inventory() {
        let payload = EntityPayload::decode(
            EntityType::Inventory,
            "i-1",
            json!({"name": "Rice 5kg", "stock": 10, "unit_price": 4500}),
        )
        .unwrap();
        assert_eq!(payload.entity_type(), EntityType::Inventory);
    }

    #[test]
    fn test_decode_rejects_unknown_field() {
        let err = EntityPayload::decode(
            EntityType::Inventory,
            "i-1",
            json!({"name": "Rice", "stock": 10, "unit_price": 1, "colour": "red"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let err = EntityPayload::decode(
            EntityType::Contact,
            "c-1",
            json!({"name": "Ada", "kind": "customer", "phone": 12345}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { entity_type: EntityType::Contact, .. }));
    }

    #[test]
    fn test_decode_with_wrong_entity_type_fails() {
        let contact = json!({"name": "Ada", "kind": "customer"});
        assert!(EntityPayload::decode(EntityType::Inventory, "x", contact).is_err());
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let a = item(10).to_json().unwrap();
        let b = EntityPayload::from_json(EntityType::Inventory, "i-1", &a)
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_changed_fields() {
        assert_eq!(item(10).changed_fields(&item(8)), vec!["stock".to_string()]);
        assert!(item(10).changed_fields(&item(10)).is_empty());
    }

    #[test]
    fn test_validate_ledger_entry_sides() {
        let both = EntityPayload::LedgerEntry(LedgerEntry {
            account_code: "1000".into(),
            debit: 100,
            credit: 100,
            memo: None,
            transaction_id: None,
        });
        assert!(both.validate().is_err());

        let debit_only = EntityPayload::LedgerEntry(LedgerEntry {
            account_code: "1000".into(),
            debit: 100,
            credit: 0,
            memo: None,
            transaction_id: None,
        });
        assert!(debit_only.validate().is_ok());
    }

    #[test]
    fn test_receivable_payment() {
        let mut r = Receivable {
            contact_id: "c-1".into(),
            amount: 1000,
            amount_paid: 0,
            due_at: None,
            status: ReceivableStatus::Open,
            note: None,
        };
        r.apply_payment(400).unwrap();
        assert_eq!(r.status, ReceivableStatus::PartiallyPaid);
        assert!(r.apply_payment(700).is_err());
        r.apply_payment(600).unwrap();
        assert_eq!(r.status, ReceivableStatus::Paid);
        assert_eq!(r.balance(), 0);
    }
}
