//! 分类体系与标签
//!
//! 配置中的类别/二级类别在加载时校验为 [`Taxonomy`]，外部服务返回的自由文本
//! 只有能映射到已知 (类别, 二级类别) 组合时才会成为 [`Label::Classified`]，
//! 否则一律落到兜底标签 [`Label::Unclassified`]。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::config::types::TaxonomyConfig;

/// 兜底标签文本
pub const UNCLASSIFIED: &str = "Unclassified";

/// 类别与二级类别之间可接受的分隔符，按优先级排列
const SEPARATORS: [&str; 7] = [" / ", "/", "|", ">", ":", " - ", ","];

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Label {
    Classified {
        category: String,
        subcategory: Option<String>,
    },
    Unclassified,
}

impl Label {
    pub fn classified(category: impl Into<String>, subcategory: Option<&str>) -> Self {
        Label::Classified {
            category: category.into(),
            subcategory: subcategory.map(str::to_string),
        }
    }

    pub fn category(&self) -> &str {
        match self {
            Label::Classified { category, .. } => category,
            Label::Unclassified => UNCLASSIFIED,
        }
    }

    pub fn subcategory(&self) -> Option<&str> {
        match self {
            Label::Classified { subcategory, .. } => subcategory.as_deref(),
            Label::Unclassified => None,
        }
    }

    pub fn is_unclassified(&self) -> bool {
        matches!(self, Label::Unclassified)
    }

    /// 从输出列还原标签（检查点恢复用，不再次校验分类体系）
    pub fn from_columns(category: &str, subcategory: &str) -> Option<Self> {
        let category = category.trim();
        if category.is_empty() {
            return None;
        }
        if category.eq_ignore_ascii_case(UNCLASSIFIED) {
            return Some(Label::Unclassified);
        }
        let subcategory = subcategory.trim();
        Some(Label::Classified {
            category: category.to_string(),
            subcategory: (!subcategory.is_empty()).then(|| subcategory.to_string()),
        })
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Classified {
                category,
                subcategory: Some(sub),
            } => write!(f, "{} / {}", category, sub),
            Label::Classified { category, .. } => write!(f, "{}", category),
            Label::Unclassified => write!(f, "{}", UNCLASSIFIED),
        }
    }
}

/// 分类体系配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaxonomyError {
    #[error("分类体系为空，至少需要一个类别")]
    Empty,
    #[error("类别名称不能为空")]
    BlankCategory,
    #[error("类别 {0} 下存在空的二级类别名称")]
    BlankSubcategory(String),
    #[error("类别重复: {0}")]
    DuplicateCategory(String),
    #[error("类别 {category} 下的二级类别重复: {subcategory}")]
    DuplicateSubcategory {
        category: String,
        subcategory: String,
    },
    #[error("{0} 是保留的兜底标签，不能作为类别或二级类别")]
    ReservedName(String),
}

#[derive(Debug, Clone)]
struct CategoryEntry {
    name: String,
    subcategories: Vec<String>,
    sub_index: HashMap<String, usize>,
}

/// 经过校验的分类体系
#[derive(Debug, Clone)]
pub struct Taxonomy {
    categories: Vec<CategoryEntry>,
    index: HashMap<String, usize>,
    /// 二级类别 -> 所属类别下标；同名二级类别出现在多个类别下时不参与推断
    sub_owner: HashMap<String, Option<usize>>,
}

impl Taxonomy {
    /// 校验并构建分类体系
    pub fn from_config(config: &TaxonomyConfig) -> Result<Self, TaxonomyError> {
        if config.categories.is_empty() {
            return Err(TaxonomyError::Empty);
        }

        let mut categories = Vec::with_capacity(config.categories.len());
        let mut index = HashMap::new();
        let mut sub_owner: HashMap<String, Option<usize>> = HashMap::new();

        for (cat_idx, category) in config.categories.iter().enumerate() {
            let name = category.name.trim();
            if name.is_empty() {
                return Err(TaxonomyError::BlankCategory);
            }
            let key = normalize(name);
            if key == normalize(UNCLASSIFIED) {
                return Err(TaxonomyError::ReservedName(name.to_string()));
            }
            if index.insert(key, cat_idx).is_some() {
                return Err(TaxonomyError::DuplicateCategory(name.to_string()));
            }

            let mut subcategories = Vec::with_capacity(category.subcategories.len());
            let mut sub_index = HashMap::new();
            for (sub_idx, sub) in category.subcategories.iter().enumerate() {
                let sub = sub.trim();
                if sub.is_empty() {
                    return Err(TaxonomyError::BlankSubcategory(name.to_string()));
                }
                let sub_key = normalize(sub);
                if sub_key == normalize(UNCLASSIFIED) {
                    return Err(TaxonomyError::ReservedName(sub.to_string()));
                }
                if sub_index.insert(sub_key.clone(), sub_idx).is_some() {
                    return Err(TaxonomyError::DuplicateSubcategory {
                        category: name.to_string(),
                        subcategory: sub.to_string(),
                    });
                }
                sub_owner
                    .entry(sub_key)
                    .and_modify(|owner| *owner = None)
                    .or_insert(Some(cat_idx));
                subcategories.push(sub.to_string());
            }

            categories.push(CategoryEntry {
                name: name.to_string(),
                subcategories,
                sub_index,
            });
        }

        Ok(Self {
            categories,
            index,
            sub_owner,
        })
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn pair_count(&self) -> usize {
        self.categories.iter().map(|c| c.subcategories.len()).sum()
    }

    /// 将外部服务的回答映射到分类体系，无法识别时返回兜底标签
    pub fn resolve(&self, answer: &str) -> Label {
        let cleaned = clean_answer(answer);
        if cleaned.is_empty() {
            return Label::Unclassified;
        }

        if cleaned.starts_with('{') {
            if let Some(label) = self.resolve_json(&cleaned) {
                return label;
            }
        }

        self.resolve_text(&cleaned).unwrap_or(Label::Unclassified)
    }

    fn resolve_text(&self, text: &str) -> Option<Label> {
        if let Some(label) = self.lookup_single(text) {
            return Some(label);
        }

        for sep in SEPARATORS {
            for (pos, _) in text.match_indices(sep) {
                let (left, right) = (&text[..pos], &text[pos + sep.len()..]);
                if let Some(label) = self.lookup_pair(left, Some(right)) {
                    return Some(label);
                }
            }
        }
        None
    }

    fn resolve_json(&self, text: &str) -> Option<Label> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let pick = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string)
        };
        let category = pick(&["category", "field"])?;
        let subcategory = pick(&["subcategory", "sub_category", "major"]);
        match subcategory.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(sub) => self.lookup_pair(&category, Some(sub)),
            None => self.lookup_single(&category),
        }
    }

    /// 单个名称：没有二级类别的类别，或只属于一个类别的二级类别
    fn lookup_single(&self, name: &str) -> Option<Label> {
        let key = normalize(name);
        if self.index.contains_key(&key) {
            return self.lookup_pair(name, None);
        }
        let owner = (*self.sub_owner.get(&key)?)?;
        let entry = &self.categories[owner];
        let sub_idx = *entry.sub_index.get(&key)?;
        Some(Label::classified(
            entry.name.clone(),
            Some(entry.subcategories[sub_idx].as_str()),
        ))
    }

    fn lookup_pair(&self, category: &str, subcategory: Option<&str>) -> Option<Label> {
        let cat_idx = *self.index.get(&normalize(category))?;
        let entry = &self.categories[cat_idx];
        match subcategory {
            Some(sub) => {
                let sub_idx = *entry.sub_index.get(&normalize(sub))?;
                Some(Label::classified(
                    entry.name.clone(),
                    Some(entry.subcategories[sub_idx].as_str()),
                ))
            }
            // 有二级类别时只给出类别不构成合法组合
            None if entry.subcategories.is_empty() => {
                Some(Label::classified(entry.name.clone(), None))
            }
            None => None,
        }
    }

    /// 按当前分类体系规范化已有标签（检查点恢复用）；不再合法时返回 None
    pub fn canonical(&self, label: &Label) -> Option<Label> {
        match label {
            Label::Unclassified => Some(Label::Unclassified),
            Label::Classified {
                category,
                subcategory,
            } => self.lookup_pair(category, subcategory.as_deref()),
        }
    }

    /// 生成提示词中使用的分类清单
    pub fn prompt_listing(&self) -> String {
        self.categories
            .iter()
            .map(|c| {
                if c.subcategories.is_empty() {
                    format!("- {}", c.name)
                } else {
                    format!("- {}: {}", c.name, c.subcategories.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 去掉常见的包裹符号、前缀和句尾标点，只保留第一行有效内容
fn clean_answer(answer: &str) -> String {
    let trimmed = answer.trim();
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }
    let line = trimmed
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let line = line
        .strip_prefix("Answer:")
        .or_else(|| line.strip_prefix("Category:"))
        .or_else(|| line.strip_prefix("Label:"))
        .unwrap_or(line);
    line.trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '.' | ' '))
        .to_string()
}

fn normalize(value: &str) -> String {
    value
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '.'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::config::types::CategoryConfig;

    fn taxonomy() -> Taxonomy {
        Taxonomy::from_config(&TaxonomyConfig {
            categories: vec![
                CategoryConfig {
                    name: "Engineering".to_string(),
                    subcategories: vec![
                        "Computer Science".to_string(),
                        "Civil Engineering".to_string(),
                        "Design".to_string(),
                    ],
                },
                CategoryConfig {
                    name: "Arts".to_string(),
                    subcategories: vec!["Music".to_string(), "Design".to_string()],
                },
                CategoryConfig {
                    name: "Law".to_string(),
                    subcategories: vec![],
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_resolves_pairs_with_various_separators() {
        let t = taxonomy();
        let expected = Label::classified("Engineering", Some("Computer Science"));
        assert_eq!(t.resolve("Engineering / Computer Science"), expected);
        assert_eq!(t.resolve("engineering|computer science"), expected);
        assert_eq!(t.resolve("**Engineering: Computer  Science.**"), expected);
        assert_eq!(t.resolve("Answer: Engineering > Computer Science\nbecause..."), expected);
    }

    #[test]
    fn test_resolves_single_names() {
        let t = taxonomy();
        assert_eq!(t.resolve("Law"), Label::classified("Law", None));
        // 有二级类别的类别单独出现不是合法组合
        assert_eq!(t.resolve("  arts "), Label::Unclassified);
        assert_eq!(t.resolve("Engineering"), Label::Unclassified);
        // 唯一归属的二级类别可以推断出类别
        assert_eq!(t.resolve("Music"), Label::classified("Arts", Some("Music")));
        // 多个类别都有的二级类别无法推断
        assert_eq!(t.resolve("Design"), Label::Unclassified);
        assert_eq!(t.resolve("Arts / Design"), Label::classified("Arts", Some("Design")));
    }

    #[test]
    fn test_unknown_answers_fall_back_to_sentinel() {
        let t = taxonomy();
        assert_eq!(t.resolve(""), Label::Unclassified);
        assert_eq!(t.resolve("Astronomy"), Label::Unclassified);
        assert_eq!(t.resolve("Engineering / Music"), Label::Unclassified);
        assert_eq!(t.resolve("I am not sure what this is"), Label::Unclassified);
        assert_eq!(t.resolve("Unclassified"), Label::Unclassified);
    }

    #[test]
    fn test_resolves_json_answers() {
        let t = taxonomy();
        assert_eq!(
            t.resolve(r#"{"field": "Engineering", "major": "Civil Engineering"}"#),
            Label::classified("Engineering", Some("Civil Engineering"))
        );
        assert_eq!(
            t.resolve(r#"{"category": "Law"}"#),
            Label::classified("Law", None)
        );
        assert_eq!(t.resolve(r#"{"category": "Space"}"#), Label::Unclassified);
        assert_eq!(t.resolve(r#"{"category": "Arts"}"#), Label::Unclassified);
        assert_eq!(
            t.resolve(r#"{"category": "Arts", "subcategory": ""}"#),
            Label::Unclassified
        );
    }

    #[test]
    fn test_canonical_rechecks_restored_labels() {
        let t = taxonomy();
        assert_eq!(
            t.canonical(&Label::classified("arts", Some("music"))),
            Some(Label::classified("Arts", Some("Music")))
        );
        assert_eq!(t.canonical(&Label::classified("Law", None)), Some(Label::classified("Law", None)));
        assert_eq!(t.canonical(&Label::Unclassified), Some(Label::Unclassified));
        assert_eq!(t.canonical(&Label::classified("Arts", None)), None);
        assert_eq!(t.canonical(&Label::classified("Arts", Some("Painting"))), None);
        assert_eq!(t.canonical(&Label::classified("Astronomy", None)), None);
    }

    #[test]
    fn test_rejects_invalid_taxonomies() {
        assert_eq!(
            Taxonomy::from_config(&TaxonomyConfig::default()).unwrap_err(),
            TaxonomyError::Empty
        );

        let dup = TaxonomyConfig {
            categories: vec![
                CategoryConfig {
                    name: "Arts".to_string(),
                    subcategories: vec![],
                },
                CategoryConfig {
                    name: " arts ".to_string(),
                    subcategories: vec![],
                },
            ],
        };
        assert!(matches!(
            Taxonomy::from_config(&dup),
            Err(TaxonomyError::DuplicateCategory(_))
        ));

        let reserved = TaxonomyConfig {
            categories: vec![CategoryConfig {
                name: "Unclassified".to_string(),
                subcategories: vec![],
            }],
        };
        assert!(matches!(
            Taxonomy::from_config(&reserved),
            Err(TaxonomyError::ReservedName(_))
        ));
    }

    #[test]
    fn test_label_columns() {
        assert_eq!(Label::from_columns("", ""), None);
        assert_eq!(
            Label::from_columns("unclassified", ""),
            Some(Label::Unclassified)
        );
        let label = Label::from_columns("Arts", "Music").unwrap();
        assert_eq!(label.category(), "Arts");
        assert_eq!(label.subcategory(), Some("Music"));
        assert_eq!(label.to_string(), "Arts / Music");
        assert_eq!(Label::Unclassified.category(), UNCLASSIFIED);
    }
}
