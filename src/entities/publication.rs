use crate::abac::{FilterableEntity, TableEntityId};
use crate::entities::{optional_text, required_text, SCHEMA, SERVICE};
use crate::errors::RowguardError;
use crate::formula::{AttributeBag, FieldDef, Kind, Value};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "publication")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub branch: String,
    pub theme: String,
    pub author_id: String,
    pub status: String,
    pub publication_date: Option<Date>,
    pub title: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const TABLE: &str = "publication";

pub const FIELDS: &[FieldDef] = &[
    FieldDef::new("id", Kind::String),
    FieldDef::new("branch", Kind::String),
    FieldDef::new("theme", Kind::String),
    FieldDef::new("author_id", Kind::String),
    FieldDef::new("status", Kind::String),
    FieldDef::new("publication_date", Kind::Date),
    FieldDef::new("title", Kind::String),
];

impl FilterableEntity for Model {
    fn table_entity() -> TableEntityId {
        TableEntityId::new(SERVICE, SCHEMA, TABLE)
    }

    fn fields() -> &'static [FieldDef] {
        FIELDS
    }

    fn record_id(&self) -> String {
        self.id.clone()
    }

    fn attributes(&self) -> AttributeBag {
        AttributeBag::new()
            .with("id", self.id.as_str())
            .with("branch", self.branch.as_str())
            .with("theme", self.theme.as_str())
            .with("author_id", self.author_id.as_str())
            .with("status", self.status.as_str())
            .with("publication_date", self.publication_date)
            .with("title", self.title.clone())
    }

    fn clear_field(&mut self, field: &str) -> bool {
        match field {
            "id" => self.id.clear(),
            "branch" => self.branch.clear(),
            "theme" => self.theme.clear(),
            "author_id" => self.author_id.clear(),
            "status" => self.status.clear(),
            "publication_date" => self.publication_date = None,
            "title" => self.title = None,
            _ => return false,
        }
        true
    }
}

impl Model {
    pub fn from_attributes(bag: &AttributeBag) -> Result<Self, RowguardError> {
        let publication_date = match bag.get("publication_date") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_date().ok_or_else(|| {
                RowguardError::invalid_row(
                    TABLE,
                    format!("`publication_date` must be a date, got {}", value.kind()),
                )
            })?),
        };
        Ok(Self {
            id: required_text(bag, TABLE, "id")?,
            branch: required_text(bag, TABLE, "branch")?,
            theme: required_text(bag, TABLE, "theme")?,
            author_id: required_text(bag, TABLE, "author_id")?,
            status: required_text(bag, TABLE, "status")?,
            publication_date,
            title: optional_text(bag, TABLE, "title")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_date_strings_are_accepted() {
        let bag = AttributeBag::new()
            .with("id", "p1")
            .with("branch", "NY")
            .with("theme", "science")
            .with("author_id", "e1")
            .with("status", "draft")
            .with("publication_date", "2023-06-10");
        let model = Model::from_attributes(&bag).unwrap();
        assert_eq!(model.publication_date, NaiveDate::from_ymd_opt(2023, 6, 10));
        assert_eq!(model.title, None);
        assert!(matches!(
            model.attributes().get("publication_date"),
            Some(Value::Date(_))
        ));
    }
}
