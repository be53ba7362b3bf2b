use crate::abac::{FilterableEntity, TableEntityId};
use crate::entities::{decoded_list, encoded_list, optional_text, required_text, SCHEMA, SERVICE};
use crate::errors::RowguardError;
use crate::formula::{AttributeBag, FieldDef, Kind, Value};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "employee")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub branch: String,
    pub roles: String,  // JSON-encoded string array
    pub skills: String, // JSON-encoded string array
    pub passport: Option<String>,
    pub salary: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const TABLE: &str = "employee";

pub const FIELDS: &[FieldDef] = &[
    FieldDef::new("id", Kind::String),
    FieldDef::new("name", Kind::String),
    FieldDef::new("branch", Kind::String),
    FieldDef::new("roles", Kind::Array),
    FieldDef::new("skills", Kind::Array),
    FieldDef::new("passport", Kind::String),
    FieldDef::new("salary", Kind::Number),
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
            .with("name", self.name.as_str())
            .with("branch", self.branch.as_str())
            .with("roles", decoded_list(&self.roles))
            .with("skills", decoded_list(&self.skills))
            .with("passport", self.passport.clone())
            .with("salary", self.salary)
    }

    fn clear_field(&mut self, field: &str) -> bool {
        match field {
            "id" => self.id.clear(),
            "name" => self.name.clear(),
            "branch" => self.branch.clear(),
            "roles" => self.roles = "[]".to_string(),
            "skills" => self.skills = "[]".to_string(),
            "passport" => self.passport = None,
            "salary" => self.salary = None,
            _ => return false,
        }
        true
    }
}

impl Model {
    pub fn from_attributes(bag: &AttributeBag) -> Result<Self, RowguardError> {
        let salary = match bag.get("salary") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| {
                RowguardError::invalid_row(TABLE, format!("`salary` must be an integer, got {}", value.kind()))
            })?),
        };
        Ok(Self {
            id: required_text(bag, TABLE, "id")?,
            name: required_text(bag, TABLE, "name")?,
            branch: required_text(bag, TABLE, "branch")?,
            roles: encoded_list(bag, TABLE, "roles")?,
            skills: encoded_list(bag, TABLE, "skills")?,
            passport: optional_text(bag, TABLE, "passport")?,
            salary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model {
            id: "e1".into(),
            name: "John".into(),
            branch: "NY".into(),
            roles: r#"["chief_editor"]"#.into(),
            skills: r#"["rust","sql"]"#.into(),
            passport: Some("AB123".into()),
            salary: Some(250000),
        }
    }

    #[test]
    fn test_attributes_decode_lists() {
        let attrs = model().attributes();
        assert_eq!(
            attrs.get("roles"),
            Some(&Value::from(vec!["chief_editor".to_string()]))
        );
        assert_eq!(attrs.get("salary"), Some(&Value::Int(250000)));
        assert_eq!(Model::from_attributes(&attrs).unwrap(), model());
    }

    #[test]
    fn test_clear_field() {
        let mut m = model();
        assert!(m.clear_field("passport"));
        assert!(m.clear_field("salary"));
        assert!(!m.clear_field("nope"));
        assert_eq!(m.passport, None);
        assert_eq!(m.salary, None);
    }

    #[test]
    fn test_from_attributes_rejects_wrong_kinds() {
        let bag = model().attributes().with("salary", "lots");
        assert!(matches!(
            Model::from_attributes(&bag),
            Err(RowguardError::InvalidRow { .. })
        ));
    }
}
