#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("create database dir {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A row holds a value none of our enums recognise.
    #[error("corrupt row in {table}: column {column} = {value:?}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        value: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
