use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::field::{self, Field};

/// Client-assigned identifier shared by proformas and items.
pub type StableId = i64;

/// One customer-facing proforma document.
///
/// Every attribute other than `id` is a [`Field`] so a client may send a
/// partial record or clear single attributes; see [`Proforma::merge_from`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proforma {
    #[serde(deserialize_with = "field::stable_id")]
    pub id: StableId,
    #[serde(default)]
    pub proforma_number: Field<String>,
    #[serde(default)]
    pub customer_name: Field<String>,
    #[serde(default)]
    pub plate_number: Field<String>,
    #[serde(default)]
    pub vin: Field<String>,
    #[serde(default)]
    pub model: Field<String>,
    #[serde(default)]
    pub reference_number: Field<String>,
    #[serde(default)]
    pub delivery_time: Field<String>,
    #[serde(default)]
    pub prepared_by: Field<String>,
    #[serde(default)]
    pub date_created: Field<String>,
    #[serde(default)]
    pub sub_total: Field<f64>,
    #[serde(default)]
    pub vat: Field<f64>,
    #[serde(default)]
    pub total_amount: Field<f64>,
    #[serde(default)]
    pub last_modified: Field<String>,
}

impl Proforma {
    #[must_use]
    pub fn new(id: StableId) -> Self {
        Self { id, ..Self::default() }
    }

    /// Apply every attribute `incoming` carries: values overwrite, `null`s
    /// clear, missing attributes leave the stored value untouched.
    pub fn merge_from(&mut self, incoming: &Self) {
        incoming.proforma_number.apply_to(&mut self.proforma_number);
        incoming.customer_name.apply_to(&mut self.customer_name);
        incoming.plate_number.apply_to(&mut self.plate_number);
        incoming.vin.apply_to(&mut self.vin);
        incoming.model.apply_to(&mut self.model);
        incoming.reference_number.apply_to(&mut self.reference_number);
        incoming.delivery_time.apply_to(&mut self.delivery_time);
        incoming.prepared_by.apply_to(&mut self.prepared_by);
        incoming.date_created.apply_to(&mut self.date_created);
        incoming.sub_total.apply_to(&mut self.sub_total);
        incoming.vat.apply_to(&mut self.vat);
        incoming.total_amount.apply_to(&mut self.total_amount);
        incoming.last_modified.apply_to(&mut self.last_modified);
    }

    /// Newest-first display order: `dateCreated` descending, then
    /// `lastModified` descending. Missing timestamps sort last.
    #[must_use]
    pub fn newest_first(lhs: &Self, rhs: &Self) -> Ordering {
        descending(text(&lhs.date_created), text(&rhs.date_created))
            .then_with(|| descending(text(&lhs.last_modified), text(&rhs.last_modified)))
    }
}

/// One line item. `proforma_id` is a weak back reference that is never validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(deserialize_with = "field::stable_id")]
    pub id: StableId,
    #[serde(default, deserialize_with = "field::stable_id_field")]
    pub proforma_id: Field<StableId>,
    #[serde(default)]
    pub item_name: Field<String>,
    #[serde(default)]
    pub unit: Field<String>,
    #[serde(default)]
    pub quantity: Field<f64>,
    #[serde(default)]
    pub cost: Field<f64>,
    #[serde(default)]
    pub price: Field<f64>,
    #[serde(default)]
    pub last_modified: Field<String>,
}

impl Item {
    #[must_use]
    pub fn new(id: StableId, proforma_id: StableId) -> Self {
        Self { id, proforma_id: Field::Set(proforma_id), ..Self::default() }
    }

    pub fn merge_from(&mut self, incoming: &Self) {
        incoming.proforma_id.apply_to(&mut self.proforma_id);
        incoming.item_name.apply_to(&mut self.item_name);
        incoming.unit.apply_to(&mut self.unit);
        incoming.quantity.apply_to(&mut self.quantity);
        incoming.cost.apply_to(&mut self.cost);
        incoming.price.apply_to(&mut self.price);
        incoming.last_modified.apply_to(&mut self.last_modified);
    }

    #[must_use]
    pub fn view(&self) -> ItemView {
        ItemView {
            item_name: self.item_name.get().cloned(),
            unit: self.unit.get().cloned(),
            quantity: self.quantity.get().copied(),
        }
    }
}

/// A client snapshot: any mix of proformas and items.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    #[serde(default)]
    pub proformas: Vec<Proforma>,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Batch {
    #[must_use]
    pub fn new(proformas: Vec<Proforma>, items: Vec<Item>) -> Self {
        Self { proformas, items }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proformas.is_empty() && self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeSummary {
    pub proformas: usize,
    pub items: usize,
}

/// Narrowed projection of an [`Item`] used in retrieval responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub item_name: Option<String>,
    pub unit: Option<String>,
    pub quantity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProformaView {
    #[serde(flatten)]
    pub proforma: Proforma,
    pub items: Vec<ItemView>,
}

fn text(value: &Field<String>) -> Option<&str> {
    value.get().map(String::as_str)
}

fn descending(lhs: Option<&str>, rhs: Option<&str>) -> Ordering {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => rhs.cmp(lhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
