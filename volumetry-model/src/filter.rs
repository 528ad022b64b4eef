use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Filters accepted by the volume listing endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Case-insensitive name substring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Name,
    Driver,
    CreatedAt,
    SizeBytes,
}

impl SortField {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "name" => Some(SortField::Name),
            "driver" => Some(SortField::Driver),
            "created_at" => Some(SortField::CreatedAt),
            "size_bytes" => Some(SortField::SizeBytes),
            _ => None,
        }
    }
}

/// Sort specification. Anything unrecognized coerces to `name:asc` rather
/// than erroring, so stale clients keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSort {
    pub field: SortField,
    pub descending: bool,
}

impl Default for VolumeSort {
    fn default() -> Self {
        Self {
            field: SortField::Name,
            descending: false,
        }
    }
}

impl VolumeSort {
    /// Parses `field` or `field:asc` / `field:desc`.
    pub fn parse(value: &str) -> Self {
        let mut parts = value.splitn(2, ':');
        let field = parts.next().unwrap_or_default().trim();
        let direction = parts.next().unwrap_or("asc").trim();

        match (SortField::parse(field), direction) {
            (Some(field), "desc") => Self {
                field,
                descending: true,
            },
            (Some(field), "asc") => Self {
                field,
                descending: false,
            },
            _ => Self::default(),
        }
    }
}

/// Offset/limit paging with defensive coercion: zero, negative, or absent
/// values fall back to defaults and `page_size` is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn from_params(page: Option<i64>, page_size: Option<i64>) -> Self {
        let page = match page {
            Some(p) if p >= 1 => p,
            _ => 1,
        };
        let limit = match page_size {
            Some(s) if s >= 1 => s.min(MAX_PAGE_SIZE),
            _ => DEFAULT_PAGE_SIZE,
        };
        Self {
            offset: (page - 1) * limit,
            limit,
        }
    }

    pub fn page_number(&self) -> i64 {
        self.offset / self.limit + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sort_coerces_to_name_asc() {
        assert_eq!(VolumeSort::parse("bogus"), VolumeSort::default());
        assert_eq!(VolumeSort::parse("name:sideways"), VolumeSort::default());
        assert_eq!(VolumeSort::parse(""), VolumeSort::default());
    }

    #[test]
    fn sort_parses_field_and_direction() {
        let sort = VolumeSort::parse("created_at:desc");
        assert_eq!(sort.field, SortField::CreatedAt);
        assert!(sort.descending);

        let sort = VolumeSort::parse("driver");
        assert_eq!(sort.field, SortField::Driver);
        assert!(!sort.descending);
    }

    #[test]
    fn paging_coerces_zero_and_negative_values() {
        let page = Page::from_params(Some(0), Some(0));
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, DEFAULT_PAGE_SIZE);

        let page = Page::from_params(Some(-3), Some(-10));
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn paging_caps_oversized_page_size() {
        let page = Page::from_params(Some(2), Some(10_000));
        assert_eq!(page.limit, MAX_PAGE_SIZE);
        assert_eq!(page.offset, MAX_PAGE_SIZE);
        assert_eq!(page.page_number(), 2);
    }
}
