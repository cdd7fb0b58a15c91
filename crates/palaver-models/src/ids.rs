//! Snowflake ids are i64 internally but cross the wire as strings, since
//! JavaScript clients lose integer precision past 2^53.

/// `#[serde(with = "ids::id_str")]` for a required id field.
pub mod id_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

/// `#[serde(default, with = "ids::id_str_opt")]` for an optional id field.
pub mod id_str_opt {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(v) => s.collect_str(v),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Num(n)) => Ok(Some(n)),
            Some(Raw::Str(s)) => s.parse().map(Some).map_err(de::Error::custom),
        }
    }
}

/// `#[serde(with = "ids::id_str_vec")]` for id lists.
pub mod id_str_vec {
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ids: &[i64], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(&id.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<i64>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| s.parse().map_err(de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "super::id_str")]
        id: i64,
        #[serde(default, with = "super::id_str_opt")]
        other: Option<i64>,
    }

    #[test]
    fn ids_serialize_as_strings() {
        let json = serde_json::to_string(&Probe { id: 9007199254740993, other: Some(7) }).unwrap();
        assert_eq!(json, r#"{"id":"9007199254740993","other":"7"}"#);
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        let p: Probe = serde_json::from_str(r#"{"id":"42","other":17}"#).unwrap();
        assert_eq!(p.id, 42);
        assert_eq!(p.other, Some(17));

        let p: Probe = serde_json::from_str(r#"{"id":42}"#).unwrap();
        assert_eq!(p.id, 42);
        assert_eq!(p.other, None);
    }

    #[test]
    fn garbage_id_is_rejected() {
        assert!(serde_json::from_str::<Probe>(r#"{"id":"not-a-number"}"#).is_err());
    }
}
