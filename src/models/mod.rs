use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Catalog record ────────────────────────────────────────────────────────────

/// One registered agrochemical product, keyed by the upstream id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogRecord {
    pub id: i64,
    pub registration_number: Option<String>,
    pub brand: Option<String>,
    pub firm: Option<String>,
    pub toxicological_class: Option<String>,
    pub active_substances: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerVariant>,
    #[serde(default)]
    pub detail: Option<ProductDetail>,
    #[serde(default)]
    pub detail_fetch_failed: bool,
}

impl CatalogRecord {
    /// Record built from list fields only, before the detail fetch.
    pub fn from_base(base: BaseFields) -> Self {
        Self {
            id: base.id,
            registration_number: base.registration_number,
            brand: base.brand,
            firm: base.firm,
            toxicological_class: base.toxicological_class,
            active_substances: base.active_substances,
            containers: Vec::new(),
            detail: None,
            detail_fetch_failed: false,
        }
    }

    pub fn with_detail(mut self, payload: DetailPayload) -> Self {
        self.detail = Some(payload.detail);
        self.containers = payload.containers;
        self.detail_fetch_failed = false;
        self
    }

    pub fn partial(mut self) -> Self {
        self.detail = None;
        self.containers.clear();
        self.detail_fetch_failed = true;
        self
    }

    pub fn is_partial(&self) -> bool {
        self.detail_fetch_failed
    }
}

/// Fields taken from a list-page item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseFields {
    pub id: i64,
    pub registration_number: Option<String>,
    pub brand: Option<String>,
    pub firm: Option<String>,
    pub toxicological_class: Option<String>,
    pub active_substances: Option<String>,
}

/// Extended attributes from the detail endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductDetail {
    pub country: Option<String>,
    pub product_state: Option<String>,
    pub product_type: Option<String>,
    pub registration_date: Option<String>,
    pub withdrawal_reason: Option<String>,
    /// Upstream breakdown kept verbatim; its shape is not stable.
    pub active_ingredients: Option<Value>,
}

/// A packaging option for a product.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerVariant {
    pub capacity: Option<f64>,
    pub unit: Option<String>,
    pub material: Option<String>,
    pub container_type: Option<String>,
    pub active: Option<bool>,
}

// ── Fetch payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMeta {
    pub total_elements: Option<u64>,
    pub total_pages: Option<u32>,
    pub number: Option<u32>,
    pub size: Option<u32>,
}

/// One page of the catalog index. Items stay raw until mapped.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub items: Vec<Value>,
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailPayload {
    pub detail: ProductDetail,
    pub containers: Vec<ContainerVariant>,
}

// ── Container grouping ────────────────────────────────────────────────────────

/// Variants sharing capacity and unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerGroup {
    pub capacity: Option<f64>,
    pub unit: Option<String>,
    pub variants: Vec<ContainerSubgroup>,
}

/// Variants sharing material and type inside a [`ContainerGroup`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSubgroup {
    pub material: Option<String>,
    pub container_type: Option<String>,
    pub count: usize,
    pub any_active: bool,
}

impl ContainerGroup {
    pub fn label(&self) -> String {
        match (self.capacity, self.unit.as_deref()) {
            (Some(c), Some(u)) => format!("{} {}", fmt_capacity(c), u),
            (Some(c), None) => fmt_capacity(c),
            (None, Some(u)) => u.to_string(),
            (None, None) => "sin capacidad".to_string(),
        }
    }
}

impl ContainerSubgroup {
    pub fn label(&self) -> String {
        match (self.material.as_deref(), self.container_type.as_deref()) {
            (Some(m), Some(t)) => format!("{} · {}", m, t),
            (Some(m), None) => m.to_string(),
            (None, Some(t)) => t.to_string(),
            (None, None) => "—".to_string(),
        }
    }
}

fn fmt_capacity(c: f64) -> String {
    if c.fract() == 0.0 {
        format!("{}", c as i64)
    } else {
        format!("{}", c)
    }
}

fn same_text(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        (None, None) => true,
        _ => false,
    }
}

/// Two-tier grouping: (capacity, unit) then (material, type).
/// Groups keep first-seen order; text keys compare case-insensitively.
pub fn group_containers(containers: &[ContainerVariant]) -> Vec<ContainerGroup> {
    let mut groups: Vec<ContainerGroup> = Vec::new();

    for c in containers {
        let idx = match groups.iter().position(|g| {
            g.capacity == c.capacity && same_text(g.unit.as_deref(), c.unit.as_deref())
        }) {
            Some(i) => i,
            None => {
                groups.push(ContainerGroup {
                    capacity: c.capacity,
                    unit: c.unit.clone(),
                    variants: Vec::new(),
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[idx];
        let active = c.active.unwrap_or(false);
        match group.variants.iter_mut().find(|s| {
            same_text(s.material.as_deref(), c.material.as_deref())
                && same_text(s.container_type.as_deref(), c.container_type.as_deref())
        }) {
            Some(sub) => {
                sub.count += 1;
                sub.any_active |= active;
            }
            None => group.variants.push(ContainerSubgroup {
                material: c.material.clone(),
                container_type: c.container_type.clone(),
                count: 1,
                any_active: active,
            }),
        }
    }

    groups
}
