#![allow(dead_code)]

pub mod db;
pub mod fixtures;

pub use db::TestDb;
pub use fixtures::{
    employee_rows, formula, formulas, policies, publication_rows, user, PolicyHarness,
    ACCOUNTANT, ADMIN, CHIEF_EDITOR, JOURNALIST,
};
