//! Core profile record model for profq.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "profq-core";

macro_rules! profile_columns {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// One column of the fixed export schema, in file order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Column {
            $($variant),+
        }

        impl Column {
            pub const ALL: &'static [Column] = &[$(Column::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Column::$variant => $name),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Column::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

profile_columns! {
    Id => "id",
    Name => "name",
    City => "city",
    CountryCode => "country_code",
    Position => "position",
    About => "about",
    Posts => "posts",
    Groups => "groups",
    CurrentCompany => "current_company",
    Experience => "experience",
    Url => "url",
    PeopleAlsoViewed => "people_also_viewed",
    EducationsDetails => "educations_details",
    Education => "education",
    RecommendationsCount => "recommendations_count",
    Avatar => "avatar",
    Courses => "courses",
    Languages => "languages",
    Certifications => "certifications",
    Recommendations => "recommendations",
    VolunteerExperience => "volunteer_experience",
    Followers => "followers",
    Connections => "connections",
    CurrentCompanyCompanyId => "current_company_company_id",
    CurrentCompanyName => "current_company_name",
    Publications => "publications",
    Patents => "patents",
    Projects => "projects",
    Organizations => "organizations",
    Location => "location",
    InputUrl => "input_url",
    LinkedinId => "linkedin_id",
    Activity => "activity",
    LinkedinNumId => "linkedin_num_id",
    BannerImage => "banner_image",
    HonorsAndAwards => "honors_and_awards",
    SimilarProfiles => "similar_profiles",
    DefaultAvatar => "default_avatar",
    MemorializedAccount => "memorialized_account",
    BioLinks => "bio_links",
}

impl Column {
    pub const COUNT: usize = Column::ALL.len();

    /// Position of the column in the export schema.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Column {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Column {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Column::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown profile column `{name}`")))
    }
}

/// Field identifying one real-world profile.
pub const NATURAL_KEY: Column = Column::LinkedinId;

/// One profile row. Every value is kept as opaque text; absent values are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    values: Vec<String>,
}

impl Default for Record {
    fn default() -> Self {
        Self::empty()
    }
}

impl Record {
    pub fn empty() -> Self {
        Self {
            values: vec![String::new(); Column::COUNT],
        }
    }

    /// Builds a record from `(column, value)` pairs, leaving the rest empty.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (Column, &'a str)>) -> Self {
        let mut record = Self::empty();
        for (column, value) in pairs {
            record.set(column, value);
        }
        record
    }

    pub fn get(&self, column: Column) -> &str {
        &self.values[column.index()]
    }

    pub fn set(&mut self, column: Column, value: impl Into<String>) {
        self.values[column.index()] = value.into();
    }

    pub fn linkedin_id(&self) -> &str {
        self.get(NATURAL_KEY)
    }

    /// True when the column is absent or only whitespace.
    pub fn is_blank(&self, column: Column) -> bool {
        self.get(column).trim().is_empty()
    }

    pub fn followers(&self) -> Option<u64> {
        parse_count(self.get(Column::Followers))
    }

    pub fn connections(&self) -> Option<u64> {
        parse_count(self.get(Column::Connections))
    }

    pub fn recommendations_count(&self) -> Option<u64> {
        parse_count(self.get(Column::RecommendationsCount))
    }

    /// Parses the `similar_profiles` JSON array. Malformed or absent JSON yields no profiles.
    pub fn similar_profiles(&self) -> Vec<SimilarProfile> {
        let raw = self.get(Column::SimilarProfiles).trim();
        if raw.is_empty() {
            return Vec::new();
        }
        serde_json::from_str::<Vec<SimilarProfile>>(raw).unwrap_or_default()
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(Column::COUNT))?;
        for column in Column::ALL {
            map.serialize_entry(column.as_str(), self.get(*column))?;
        }
        map.end()
    }
}

/// Reference to a related profile embedded in `similar_profiles`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimilarProfile {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, alias = "url_text", deserialize_with = "null_as_empty")]
    pub url: String,
}

fn null_as_empty<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn parse_count(raw: &str) -> Option<u64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

static PROFILE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/in/([^/?#]+)/?").expect("profile id regex"));

/// Extracts the profile handle following `/in/` in a profile URL.
pub fn extract_linkedin_id(url: &str) -> String {
    PROFILE_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_round_trip_in_schema_order() {
        assert_eq!(Column::COUNT, 40);
        assert_eq!(Column::ALL[0], Column::Id);
        assert_eq!(Column::ALL[31], Column::LinkedinId);
        for (idx, column) in Column::ALL.iter().enumerate() {
            assert_eq!(column.index(), idx);
            assert_eq!(Column::from_name(column.as_str()), Some(*column));
        }
        assert_eq!(Column::from_name("nope"), None);
    }

    #[test]
    fn counters_parse_lazily() {
        let record = Record::from_pairs([
            (Column::Followers, "1,234"),
            (Column::Connections, "500+"),
            (Column::RecommendationsCount, ""),
        ]);
        assert_eq!(record.followers(), Some(1234));
        assert_eq!(record.connections(), None);
        assert_eq!(record.recommendations_count(), None);
        assert_eq!(record.get(Column::Connections), "500+");
    }

    #[test]
    fn similar_profiles_accept_url_text_alias_and_nulls() {
        let record = Record::from_pairs([(
            Column::SimilarProfiles,
            r#"[{"name":"Ana","title":"Engineer","url_text":"https://x.com/in/ana"},{"name":"Bo","title":null,"url":"u"}]"#,
        )]);
        let similar = record.similar_profiles();
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].url, "https://x.com/in/ana");
        assert_eq!(similar[1].title, "");
    }

    #[test]
    fn malformed_similar_profiles_yield_empty_list() {
        let record = Record::from_pairs([(Column::SimilarProfiles, "[{not json")]);
        assert!(record.similar_profiles().is_empty());
        assert!(Record::empty().similar_profiles().is_empty());
    }

    #[test]
    fn linkedin_id_extraction() {
        assert_eq!(
            extract_linkedin_id("https://www.linkedin.com/in/jane-doe-123/?trk=x"),
            "jane-doe-123"
        );
        assert_eq!(extract_linkedin_id("https://example.com/profile"), "");
    }

    #[test]
    fn blank_detection_trims_whitespace() {
        let record = Record::from_pairs([(Column::Name, "   "), (Column::City, "Paris")]);
        assert!(record.is_blank(Column::Name));
        assert!(!record.is_blank(Column::City));
        assert!(record.is_blank(Column::Position));
    }
}
