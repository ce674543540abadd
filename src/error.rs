use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroocovError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error at position {position}: {source}")]
    Xml {
        source: quick_xml::Error,
        position: usize,
    },

    #[error("Report parse error: {0}")]
    Parse(String),

    #[error("Execution data error: {0}")]
    ExecData(String),

    #[error("Class file error: {0}")]
    ClassFile(String),
}

pub type Result<T> = std::result::Result<T, GroocovError>;
