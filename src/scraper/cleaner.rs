//! Raw upstream JSON → typed catalog fields.
//!
//! Upstream payloads have used different field names over time, so every
//! logical attribute has an ordered list of candidate keys. The first key
//! holding a usable value wins. Nothing here returns an error: a missing
//! or oddly-typed field maps to `None` / empty.

use crate::models::{BaseFields, CatalogPage, ContainerVariant, DetailPayload, PageMeta, ProductDetail};
use scraper::Html;
use serde_json::Value;

// ── Candidate keys (precedence order) ─────────────────────────────────────────

pub const ID_KEYS: &[&str] = &["id", "productoId", "productoID"];
pub const REGISTRATION_KEYS: &[&str] = &["numeroInscripcion", "numero_inscripcion"];
pub const BRAND_KEYS: &[&str] = &["marca", "nombreComercial"];
pub const FIRM_KEYS: &[&str] = &["nombreFirma", "firma"];
pub const TOX_CLASS_KEYS: &[&str] = &["claseToxicologica", "clase_toxicologica"];
pub const SUBSTANCE_KEYS: &[&str] = &["sustanciasActivas", "principiosActivos"];

pub const COUNTRY_KEYS: &[&str] = &["pais"];
pub const STATE_KEYS: &[&str] = &["estadoProducto"];
pub const TYPE_KEYS: &[&str] = &["tipoProducto"];
pub const REG_DATE_KEYS: &[&str] = &["fechaInscripcion"];
pub const WITHDRAWAL_KEYS: &[&str] = &["motivoBaja"];
pub const INGREDIENT_KEYS: &[&str] = &["principiosActivos"];
pub const CONTAINER_LIST_KEYS: &[&str] = &["envases"];

pub const CAPACITY_KEYS: &[&str] = &["capacidad", "capacity"];
pub const UNIT_KEYS: &[&str] = &["unidadMedida", "unidad", "unit"];
pub const MATERIAL_KEYS: &[&str] = &["material", "materialEnvase"];
pub const CONTAINER_TYPE_KEYS: &[&str] = &["tipoEnvase", "tipo", "type"];
pub const ACTIVE_KEYS: &[&str] = &["activo", "habilitado", "active"];

/// Keys tried when a text field arrives as a nested object.
const NESTED_TEXT_KEYS: &[&str] = &["nombre", "descripcion", "name", "value"];

const EMBEDDED_ITEMS: &str = "productosAgroquimicosFormulados";

// ── Pickers ───────────────────────────────────────────────────────────────────

fn first_present<'a>(item: &'a Value, keys: &[&str]) -> impl Iterator<Item = &'a Value> {
    keys.iter()
        .filter_map(move |k| item.get(*k))
        .filter(|v| !v.is_null())
}

fn value_as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { None } else { Some(s.to_string()) }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => NESTED_TEXT_KEYS
            .iter()
            .filter_map(|k| v.get(*k))
            .find_map(value_as_text),
        _ => None,
    }
}

pub fn pick_text(item: &Value, keys: &[&str]) -> Option<String> {
    first_present(item, keys).find_map(value_as_text)
}

pub fn pick_f64(item: &Value, keys: &[&str]) -> Option<f64> {
    first_present(item, keys).find_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    })
}

pub fn pick_bool(item: &Value, keys: &[&str]) -> Option<bool> {
    first_present(item, keys).find_map(|v| match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "si" | "sí" | "s" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Integer id from numbers or numeric strings. Zero is not an id.
pub fn resolve_id(item: &Value) -> Option<i64> {
    first_present(item, ID_KEYS)
        .find_map(|v| match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|id| *id != 0)
}

/// Drop markup tags and decode entities; `None` when nothing is left.
pub fn strip_markup(input: &str) -> Option<String> {
    let fragment = Html::parse_fragment(input);
    let text: String = fragment.root_element().text().collect();
    let text = text.trim();
    if text.is_empty() { None } else { Some(text.to_string()) }
}

// ── Mappers ───────────────────────────────────────────────────────────────────

/// List item → base fields, or `None` when no id can be resolved.
pub fn map_base_fields(item: &Value) -> Option<BaseFields> {
    let id = resolve_id(item)?;
    Some(BaseFields {
        id,
        registration_number: pick_text(item, REGISTRATION_KEYS),
        brand: pick_text(item, BRAND_KEYS),
        firm: pick_text(item, FIRM_KEYS),
        toxicological_class: pick_text(item, TOX_CLASS_KEYS),
        active_substances: pick_text(item, SUBSTANCE_KEYS).and_then(|s| strip_markup(&s)),
    })
}

pub fn map_container(item: &Value) -> ContainerVariant {
    ContainerVariant {
        capacity: pick_f64(item, CAPACITY_KEYS),
        unit: pick_text(item, UNIT_KEYS),
        material: pick_text(item, MATERIAL_KEYS),
        container_type: pick_text(item, CONTAINER_TYPE_KEYS),
        active: pick_bool(item, ACTIVE_KEYS),
    }
}

pub fn map_containers(list: Option<&Value>) -> Vec<ContainerVariant> {
    list.and_then(Value::as_array)
        .map(|arr| arr.iter().filter(|v| v.is_object()).map(map_container).collect())
        .unwrap_or_default()
}

/// Detail body → fixed projection + container list.
pub fn map_detail(body: &Value) -> DetailPayload {
    let detail = ProductDetail {
        country: pick_text(body, COUNTRY_KEYS),
        product_state: pick_text(body, STATE_KEYS),
        product_type: pick_text(body, TYPE_KEYS),
        registration_date: pick_text(body, REG_DATE_KEYS),
        withdrawal_reason: pick_text(body, WITHDRAWAL_KEYS),
        active_ingredients: first_present(body, INGREDIENT_KEYS).next().cloned(),
    };
    let containers = map_containers(first_present(body, CONTAINER_LIST_KEYS).next());
    DetailPayload { detail, containers }
}

fn meta_u64(meta: &Value, key: &str) -> Option<u64> {
    meta.get(key).and_then(Value::as_u64)
}

/// HAL list body → items + page metadata.
pub fn map_page(body: &Value) -> CatalogPage {
    let items = body
        .pointer(&format!("/_embedded/{}", EMBEDDED_ITEMS))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let meta = body.get("page").filter(|m| m.is_object()).map(|m| PageMeta {
        total_elements: meta_u64(m, "totalElements"),
        total_pages: meta_u64(m, "totalPages").map(|n| n as u32),
        number: meta_u64(m, "number").map(|n| n as u32),
        size: meta_u64(m, "size").map(|n| n as u32),
    });

    CatalogPage { items, meta }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
