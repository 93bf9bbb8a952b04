//! Identifier helpers shared by inference and ontology generation.

/// Suffixes that mark a column as a reference to another table.
pub const REFERENCE_SUFFIXES: &[&str] = &["_id", "_key", "_sku", "_code", "_ref"];

/// Bare column names that identify a row on their own.
const IDENTIFIER_NAMES: &[&str] = &["id", "key", "sku", "code", "ref", "uuid"];

/// English singular of a (snake_case) table name.
pub fn singularize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.len() > 3 && lower.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if lower.ends_with("sses")
        || lower.ends_with("xes")
        || lower.ends_with("ches")
        || lower.ends_with("shes")
        || lower.ends_with("zes")
    {
        word[..word.len() - 2].to_string()
    } else if lower.len() > 1
        && lower.ends_with('s')
        && !lower.ends_with("ss")
        && !lower.ends_with("us")
        && !lower.ends_with("is")
    {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// `order_items` -> `OrderItem`
pub fn to_pascal_singular(table: &str) -> String {
    let parts: Vec<&str> = table
        .split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.')
        .filter(|p| !p.is_empty())
        .collect();
    let last = parts.len().saturating_sub(1);

    let mut out = String::new();
    for (idx, part) in parts.iter().enumerate() {
        let word = if idx == last { singularize(part) } else { part.to_string() };
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }

    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 'T');
    }
    out
}

/// Column name without its reference suffix, plus whether one was present.
pub fn column_stem(column: &str) -> (String, bool) {
    let lower = column.to_ascii_lowercase();
    for suffix in REFERENCE_SUFFIXES {
        if let Some(stem) = lower.strip_suffix(suffix) {
            if !stem.is_empty() {
                return (stem.to_string(), true);
            }
        }
    }
    (lower, false)
}

/// Whether a column name reads like a row identifier.
pub fn is_identifier_name(column: &str) -> bool {
    let lower = column.to_ascii_lowercase();
    IDENTIFIER_NAMES.contains(&lower.as_str()) || column_stem(&lower).1
}

/// `customer_id` -> `HAS_CUSTOMER`
pub fn relationship_type(column: &str) -> String {
    let (stem, _) = column_stem(column);
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("HAS_{}", cleaned.trim_matches('_'))
}

/// Graph labels, relationship types and property names: ASCII identifiers.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singularize() {
        assert_eq!(singularize("customers"), "customer");
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("addresses"), "address");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("status"), "status");
        assert_eq!(singularize("inventory"), "inventory");
    }

    #[test]
    fn test_pascal_singular_labels() {
        assert_eq!(to_pascal_singular("order_items"), "OrderItem");
        assert_eq!(to_pascal_singular("categories"), "Category");
        assert_eq!(to_pascal_singular("customers"), "Customer");
        assert_eq!(to_pascal_singular("2024_sales"), "T2024Sale");
    }

    #[test]
    fn test_relationship_type() {
        assert_eq!(relationship_type("customer_id"), "HAS_CUSTOMER");
        assert_eq!(relationship_type("product_sku"), "HAS_PRODUCT");
        assert_eq!(relationship_type("manager"), "HAS_MANAGER");
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier_name("sku"));
        assert!(is_identifier_name("customer_id"));
        assert!(!is_identifier_name("city"));
        assert!(is_valid_identifier("OrderItem"));
        assert!(!is_valid_identifier("Order Item"));
        assert!(!is_valid_identifier("1abc"));
    }
}
