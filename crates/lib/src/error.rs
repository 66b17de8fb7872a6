use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("component name `{0}` is reserved in a client SDK language")]
    ReservedComponentName(String),
    #[error("property `{comp}.{prop}` is a reserved keyword and would break generated client code")]
    ReservedPropertyName { comp: String, prop: String },
    #[error("property `{comp}.{prop}` defined more than once")]
    DuplicateProperty { comp: String, prop: String },
    #[error("`{comp}.{prop}`: default value {found} does not fit dtype {dtype}")]
    DefaultMismatch {
        comp: String,
        prop: String,
        dtype: String,
        found: String,
    },
    #[error("component `{0}` must declare at least one property")]
    NoProperties(String),
    #[error("`{comp}.{prop}`: fixed-length string/bytes capacity must be > 0")]
    ZeroCapacity { comp: String, prop: String },
    #[error("component `{0}`: OWNER permission requires a numeric `owner` property")]
    OwnerWithoutOwner(String),
    #[error("component `{comp}`: rls field `{field}` is not a declared property")]
    RlsUnknownField { comp: String, field: String },
    #[error("component `{comp}`: permission RLS requires an rls_compare tuple")]
    RlsMissing { comp: String },
    #[error("component `{comp}`: OWNER permission presets rls_compare, do not pass one")]
    RlsOnOwner { comp: String },
    #[error("component `{ns}.{name}` defined twice")]
    Redefined { ns: String, name: String },
    #[error("unknown dtype tag `{0}`")]
    BadDtype(String),
    #[error("unknown component `{ns}.{name}`")]
    UnknownComponent { ns: String, name: String },
}
