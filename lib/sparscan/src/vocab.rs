//! IRIs the engine needs to know about.

pub(crate) mod rdf {
    pub const TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
}

pub(crate) mod xsd {
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
    pub const DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
    pub const DAY_TIME_DURATION: &str = "http://www.w3.org/2001/XMLSchema#dayTimeDuration";
    pub const DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    pub const FLOAT: &str = "http://www.w3.org/2001/XMLSchema#float";
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    pub const STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

    pub const NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema#";

    /// All datatypes the numeric tower accepts when parsing from a typed
    /// literal.
    pub fn is_numeric(datatype: &str) -> bool {
        let Some(local) = datatype.strip_prefix(NAMESPACE) else {
            return false;
        };
        matches!(
            local,
            "integer"
                | "decimal"
                | "double"
                | "float"
                | "byte"
                | "short"
                | "int"
                | "long"
                | "unsignedByte"
                | "unsignedShort"
                | "unsignedInt"
                | "unsignedLong"
                | "positiveInteger"
                | "negativeInteger"
                | "nonPositiveInteger"
                | "nonNegativeInteger"
        )
    }
}
