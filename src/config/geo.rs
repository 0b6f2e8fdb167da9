// src/config/geo.rs
//! Static geography used by the classifier and the region filter.
//!
//! Three tables, all data and no logic:
//! - the canonical ordered list of prefecture / region-unit names,
//! - region → member prefectures,
//! - forecast office → prefecture(s).
//!
//! The built-in tables cover the ten JMA forecast regions. A TOML file with the
//! same shape can replace them; either way the tables are validated once and
//! never mutated afterwards.

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegionDef {
    pub name: String,
    pub prefectures: Vec<String>,
    #[serde(default)]
    pub offices: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GeoFile {
    regions: Vec<RegionDef>,
}

#[derive(Debug, Clone)]
pub struct GeoTables {
    regions: Vec<RegionDef>,
    prefectures: Vec<String>,
    region_index: HashMap<String, usize>,
    prefecture_region: HashMap<String, usize>,
    offices: HashMap<String, Vec<String>>,
}

type RegionSeed = (
    &'static str,
    &'static [&'static str],
    &'static [(&'static str, &'static [&'static str])],
);

const BUILTIN: &[RegionSeed] = &[
    (
        "北海道",
        &[
            "宗谷地方",
            "上川・留萌地方",
            "石狩・空知・後志地方",
            "網走・北見・紋別地方",
            "釧路・根室地方",
            "十勝地方",
            "胆振・日高地方",
            "渡島・檜山地方",
        ],
        &[
            ("稚内地方気象台", &["宗谷地方"]),
            ("旭川地方気象台", &["上川・留萌地方"]),
            ("札幌管区気象台", &["石狩・空知・後志地方"]),
            ("網走地方気象台", &["網走・北見・紋別地方"]),
            ("釧路地方気象台", &["釧路・根室地方"]),
            ("帯広測候所", &["十勝地方"]),
            ("室蘭地方気象台", &["胆振・日高地方"]),
            ("函館地方気象台", &["渡島・檜山地方"]),
        ],
    ),
    (
        "東北",
        &["青森県", "秋田県", "岩手県", "宮城県", "山形県", "福島県"],
        &[
            ("青森地方気象台", &["青森県"]),
            ("秋田地方気象台", &["秋田県"]),
            ("盛岡地方気象台", &["岩手県"]),
            ("仙台管区気象台", &["宮城県"]),
            ("山形地方気象台", &["山形県"]),
            ("福島地方気象台", &["福島県"]),
        ],
    ),
    (
        "関東甲信",
        &[
            "茨城県", "栃木県", "群馬県", "埼玉県", "東京都", "千葉県", "神奈川県", "長野県",
            "山梨県",
        ],
        &[
            ("水戸地方気象台", &["茨城県"]),
            ("宇都宮地方気象台", &["栃木県"]),
            ("前橋地方気象台", &["群馬県"]),
            ("熊谷地方気象台", &["埼玉県"]),
            ("東京管区気象台", &["東京都"]),
            ("銚子地方気象台", &["千葉県"]),
            ("横浜地方気象台", &["神奈川県"]),
            ("長野地方気象台", &["長野県"]),
            ("甲府地方気象台", &["山梨県"]),
        ],
    ),
    (
        "東海",
        &["静岡県", "愛知県", "岐阜県", "三重県"],
        &[
            ("静岡地方気象台", &["静岡県"]),
            ("名古屋地方気象台", &["愛知県"]),
            ("岐阜地方気象台", &["岐阜県"]),
            ("津地方気象台", &["三重県"]),
        ],
    ),
    (
        "北陸",
        &["新潟県", "富山県", "石川県", "福井県"],
        &[
            ("新潟地方気象台", &["新潟県"]),
            ("富山地方気象台", &["富山県"]),
            ("金沢地方気象台", &["石川県"]),
            ("福井地方気象台", &["福井県"]),
        ],
    ),
    (
        "近畿",
        &["滋賀県", "京都府", "大阪府", "兵庫県", "奈良県", "和歌山県"],
        &[
            ("彦根地方気象台", &["滋賀県"]),
            ("京都地方気象台", &["京都府"]),
            ("大阪管区気象台", &["大阪府"]),
            ("神戸地方気象台", &["兵庫県"]),
            ("奈良地方気象台", &["奈良県"]),
            ("和歌山地方気象台", &["和歌山県"]),
        ],
    ),
    (
        "中国",
        &["岡山県", "広島県", "島根県", "鳥取県", "山口県"],
        &[
            ("岡山地方気象台", &["岡山県"]),
            ("広島地方気象台", &["広島県"]),
            ("松江地方気象台", &["島根県"]),
            ("鳥取地方気象台", &["鳥取県"]),
            ("下関地方気象台", &["山口県"]),
        ],
    ),
    (
        "四国",
        &["徳島県", "香川県", "愛媛県", "高知県"],
        &[
            ("徳島地方気象台", &["徳島県"]),
            ("高松地方気象台", &["香川県"]),
            ("松山地方気象台", &["愛媛県"]),
            ("高知地方気象台", &["高知県"]),
        ],
    ),
    (
        "九州",
        &[
            "福岡県", "大分県", "長崎県", "佐賀県", "熊本県", "宮崎県", "鹿児島県", "奄美地方",
        ],
        &[
            ("福岡管区気象台", &["福岡県"]),
            ("大分地方気象台", &["大分県"]),
            ("長崎地方気象台", &["長崎県"]),
            ("佐賀地方気象台", &["佐賀県"]),
            ("熊本地方気象台", &["熊本県"]),
            ("宮崎地方気象台", &["宮崎県"]),
            ("鹿児島地方気象台", &["鹿児島県"]),
            ("名瀬測候所", &["奄美地方"]),
        ],
    ),
    (
        "沖縄",
        &["沖縄本島地方", "大東島地方", "宮古島地方", "八重山地方"],
        &[
            ("沖縄気象台", &["沖縄本島地方"]),
            ("南大東島地方気象台", &["大東島地方"]),
            ("宮古島地方気象台", &["宮古島地方"]),
            ("石垣島地方気象台", &["八重山地方"]),
        ],
    ),
];

static BUILTIN_TABLES: Lazy<GeoTables> = Lazy::new(|| {
    let regions = BUILTIN
        .iter()
        .map(|(name, prefs, offices)| RegionDef {
            name: (*name).to_string(),
            prefectures: prefs.iter().map(|p| (*p).to_string()).collect(),
            offices: offices
                .iter()
                .map(|(o, ps)| ((*o).to_string(), ps.iter().map(|p| (*p).to_string()).collect()))
                .collect(),
        })
        .collect();
    GeoTables::from_regions(regions).expect("built-in geo tables are consistent")
});

impl GeoTables {
    pub fn builtin() -> &'static GeoTables {
        &BUILTIN_TABLES
    }

    /// Build and validate tables from region definitions.
    pub fn from_regions(regions: Vec<RegionDef>) -> Result<Self> {
        if regions.is_empty() {
            bail!("geo tables: no regions defined");
        }
        let mut prefectures = Vec::new();
        let mut region_index = HashMap::new();
        let mut prefecture_region = HashMap::new();
        let mut offices: HashMap<String, Vec<String>> = HashMap::new();

        for (idx, r) in regions.iter().enumerate() {
            let name = r.name.trim();
            if name.is_empty() {
                bail!("geo tables: region #{idx} has an empty name");
            }
            if region_index.insert(name.to_string(), idx).is_some() {
                bail!("geo tables: region {name} defined twice");
            }
            for p in &r.prefectures {
                if p.trim().is_empty() {
                    bail!("geo tables: region {name} lists an empty prefecture");
                }
                if let Some(prev) = prefecture_region.insert(p.clone(), idx) {
                    bail!(
                        "geo tables: {p} belongs to both {} and {name}",
                        regions[prev].name
                    );
                }
                prefectures.push(p.clone());
            }
        }

        let known: HashSet<&String> = prefectures.iter().collect();
        for r in &regions {
            for (office, targets) in &r.offices {
                if targets.is_empty() {
                    bail!("geo tables: office {office} maps to no prefecture");
                }
                if let Some(bad) = targets.iter().find(|t| !known.contains(t)) {
                    bail!("geo tables: office {office} maps to unknown prefecture {bad}");
                }
                if offices.insert(office.clone(), targets.clone()).is_some() {
                    bail!("geo tables: office {office} defined twice");
                }
            }
        }

        Ok(Self {
            regions,
            prefectures,
            region_index,
            prefecture_region,
            offices,
        })
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: GeoFile = toml::from_str(s).context("parsing geo tables toml")?;
        Self::from_regions(file.regions)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading geo tables from {}", path.display()))?;
        Self::from_toml_str(&s).map_err(|e| anyhow!("{}: {e:#}", path.display()))
    }

    /// Canonical, ordered list of every prefecture / region unit.
    pub fn prefectures(&self) -> &[String] {
        &self.prefectures
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.name.as_str())
    }

    pub fn region_members(&self, region: &str) -> Option<&[String]> {
        self.region_index
            .get(region)
            .map(|&i| self.regions[i].prefectures.as_slice())
    }

    pub fn region_of(&self, prefecture: &str) -> Option<&str> {
        self.prefecture_region
            .get(prefecture)
            .map(|&i| self.regions[i].name.as_str())
    }

    pub fn is_known_prefecture(&self, name: &str) -> bool {
        self.prefecture_region.contains_key(name)
    }

    /// Prefectures served by a forecast office; empty when the office is unknown.
    pub fn offices_for(&self, office: &str) -> &[String] {
        self.offices
            .get(office.trim())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every known prefecture name occurring in `text`, in canonical order.
    pub fn scan_content(&self, text: &str) -> Vec<String> {
        self.prefectures
            .iter()
            .filter(|p| text.contains(p.as_str()))
            .cloned()
            .collect()
    }
}
