//! HTML extraction cascade, record normalization, and synthetic fallback
//! generation for yearly problem-statement listings.
//!
//! The listing site's markup is not under our control and changes without
//! notice, so extraction runs a cascade of structural heuristics: structured
//! table rows first, then class-hinted containers, then a free-text sweep.
//! The first tier that yields candidates wins; zero candidates across all
//! tiers is a normal outcome the orchestrator handles with synthetic data.

use chrono::{DateTime, Utc};
use psh_core::{
    edition_label, Difficulty, ProblemStatement, DEFAULT_ORGANIZATION_NAME,
    DEFAULT_ORGANIZATION_SECTOR, DEFAULT_ORGANIZATION_TYPE, EDITION_PREFIX, GENERAL_CATEGORY,
};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "psh-extract";

const ID_HEADER_LABEL: &str = "Problem Statement ID";
const TITLE_HEADER_LABEL: &str = "Problem Statement Title";
const DESCRIPTION_HEADER_LABEL: &str = "Description";

/// Minimum length for a table cell to count as real title/description text.
const MIN_CELL_LEN: usize = 5;
/// Minimum text length for a free-text tier candidate.
const MIN_BLOCK_TEXT_LEN: usize = 50;
/// Description text from unstructured elements is truncated to this length.
const MAX_DESCRIPTION_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

fn sel(raw: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw).map_err(|e| ExtractError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

/// Year-specific inputs the free-text tier matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractContext {
    pub year: i32,
}

/// One probable problem-statement entry, detached from the parsed document
/// so the cascade output is owned and freely passed across await points.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    TableRow { cells: Vec<String> },
    Block(BlockCandidate),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockCandidate {
    pub heading: Option<String>,
    pub paragraphs: Option<String>,
    pub category_hint: Option<String>,
    pub organization_hint: Option<String>,
    /// Trimmed texts of all descendant elements, for the title fallback.
    pub texts: Vec<String>,
    pub full_text: String,
}

type Tier = fn(&Html, &ExtractContext) -> Result<Vec<Candidate>, ExtractError>;

const TIERS: &[Tier] = &[tabular_rows, class_hint_blocks, free_text_blocks];

/// Run the extraction cascade over a raw HTML document.
///
/// Tiers are tried in order; the first non-empty result wins. An empty
/// vector means every tier came up dry, not that anything went wrong.
pub fn extract_candidates(
    html: &str,
    ctx: &ExtractContext,
) -> Result<Vec<Candidate>, ExtractError> {
    let document = Html::parse_document(html);
    for tier in TIERS {
        let candidates = tier(&document, ctx)?;
        if !candidates.is_empty() {
            return Ok(candidates);
        }
    }
    Ok(Vec::new())
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_serial(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}

/// Tier 1: rows of the listing table that look like data rows.
fn tabular_rows(document: &Html, _ctx: &ExtractContext) -> Result<Vec<Candidate>, ExtractError> {
    let row_sel = sel("table tr")?;
    let cell_sel = sel("td, th")?;

    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
        if is_problem_row(&cells) {
            out.push(Candidate::TableRow { cells });
        }
    }
    Ok(out)
}

fn is_problem_row(cells: &[String]) -> bool {
    if cells.len() < 3 {
        return false;
    }
    let first = cells[0].as_str();
    let second = cells[1].as_str();
    let third = cells[2].as_str();

    // Header and separator rows never carry data.
    if first.is_empty() || second.is_empty() {
        return false;
    }
    if first.contains("S.No") || first.starts_with("Sr.") {
        return false;
    }

    first.contains(ID_HEADER_LABEL)
        || second.contains(TITLE_HEADER_LABEL)
        || (is_serial(first) && second.len() > MIN_CELL_LEN && third.len() > MIN_CELL_LEN)
}

struct BlockSelectors {
    heading: Selector,
    paragraph: Selector,
    category: Selector,
    organization: Selector,
    any: Selector,
}

impl BlockSelectors {
    fn build() -> Result<Self, ExtractError> {
        Ok(Self {
            heading: sel("h1, h2, h3, h4, .title, [class*=\"title\"], .ps-title, .problem-title")?,
            paragraph: sel(
                "p, .description, [class*=\"desc\"], [class*=\"content\"], .ps-desc, .problem-desc",
            )?,
            category: sel(
                ".category, [class*=\"category\"], [class*=\"domain\"], .ps-category, .problem-category",
            )?,
            organization: sel(
                ".organization, [class*=\"org\"], [class*=\"company\"], .ps-org, .problem-org",
            )?,
            any: sel("*")?,
        })
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn block_candidate(el: ElementRef<'_>, selectors: &BlockSelectors) -> BlockCandidate {
    let heading = el
        .select(&selectors.heading)
        .map(element_text)
        .find(|t| !t.is_empty());
    let paragraphs = non_empty(collapse_whitespace(
        &el.select(&selectors.paragraph)
            .map(|p| p.text().collect::<String>())
            .collect::<Vec<_>>()
            .join(" "),
    ));
    let category_hint = el
        .select(&selectors.category)
        .map(element_text)
        .find(|t| !t.is_empty());
    let organization_hint = el
        .select(&selectors.organization)
        .map(element_text)
        .find(|t| !t.is_empty());
    let texts = el
        .select(&selectors.any)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();

    BlockCandidate {
        heading,
        paragraphs,
        category_hint,
        organization_hint,
        texts,
        full_text: element_text(el),
    }
}

/// Tier 2: containers whose class/id attributes hint at problem listings.
fn class_hint_blocks(
    document: &Html,
    _ctx: &ExtractContext,
) -> Result<Vec<Candidate>, ExtractError> {
    let hint_sel = sel(
        ".problem-statement, .ps-item, [class*=\"problem\"], [class*=\"ps\"], .ps-list, .problem-list",
    )?;
    let selectors = BlockSelectors::build()?;
    Ok(document
        .select(&hint_sel)
        .map(|el| Candidate::Block(block_candidate(el, &selectors)))
        .collect())
}

/// Tier 3: any block-level element with enough text and a listing keyword.
fn free_text_blocks(
    document: &Html,
    ctx: &ExtractContext,
) -> Result<Vec<Candidate>, ExtractError> {
    let block_sel = sel("div, article, section, tr, .row")?;
    let selectors = BlockSelectors::build()?;
    let year_text = ctx.year.to_string();

    let mut out = Vec::new();
    for el in document.select(&block_sel) {
        let text = element_text(el);
        if text.len() <= MIN_BLOCK_TEXT_LEN {
            continue;
        }
        let keyword_hit = text.contains("Problem")
            || text.contains("Challenge")
            || text.contains("Statement")
            || text.contains(EDITION_PREFIX)
            || text.contains(&year_text);
        if keyword_hit {
            out.push(Candidate::Block(block_candidate(el, &selectors)));
        }
    }
    Ok(out)
}

/// Ordered category inference rules. First match wins, so the order is part
/// of the contract: a text mentioning both health and agriculture resolves
/// to Healthcare.
pub const CATEGORY_RULES: &[(&[&str], &str)] = &[
    (&["health", "medical"], "Healthcare"),
    (&["education", "learning"], "Education"),
    (&["agriculture", "farming"], "Agriculture"),
    (&["transport", "mobility"], "Transport"),
    (&["energy", "power"], "Energy"),
    (&["environment", "climate"], "Environment"),
    (&["security", "police"], "Security"),
    (&["technology", "ai", "digital", "smart"], "Technology"),
    (&["water", "sanitation"], "Water & Sanitation"),
    (&["rural"], "Rural Development"),
    (&["urban"], "Urban Development"),
];

pub fn infer_category(text: &str) -> &'static str {
    let lower = text.to_ascii_lowercase();
    for (keywords, category) in CATEGORY_RULES {
        if keywords.iter().any(|keyword| lower.contains(keyword)) {
            return category;
        }
    }
    GENERAL_CATEGORY
}

fn strip_label_prefix(text: &str, label: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix(label) {
        let rest = rest.trim_start();
        let rest = rest.strip_prefix('|').unwrap_or(rest);
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn base_problem(
    problem_id: String,
    title: String,
    description: String,
    category: String,
    year: i32,
    now: DateTime<Utc>,
) -> ProblemStatement {
    ProblemStatement {
        problem_id,
        title,
        description,
        tags: vec![category.clone(), edition_label(year)],
        domain: vec![category.clone()],
        category,
        year,
        edition: edition_label(year),
        organization_name: DEFAULT_ORGANIZATION_NAME.to_string(),
        organization_type: DEFAULT_ORGANIZATION_TYPE.to_string(),
        organization_sector: DEFAULT_ORGANIZATION_SECTOR.to_string(),
        technology: Vec::new(),
        difficulty: Difficulty::Medium,
        expected_outcome: String::new(),
        constraints: Vec::new(),
        resources: Vec::new(),
        complexity: 1,
        estimated_effort: "2-3 months".to_string(),
        scraped_at: now,
        last_updated: now,
    }
}

/// Normalize one candidate into a draft record.
///
/// Returns `None` when the candidate does not resolve to a usable record:
/// empty title/description, or a header row whose label leaked through.
pub fn normalize(
    candidate: &Candidate,
    year: i32,
    index: usize,
    now: DateTime<Utc>,
) -> Option<ProblemStatement> {
    match candidate {
        Candidate::TableRow { cells } => normalize_table_row(cells, year, now),
        Candidate::Block(block) => normalize_block(block, year, index, now),
    }
}

fn normalize_table_row(
    cells: &[String],
    year: i32,
    now: DateTime<Utc>,
) -> Option<ProblemStatement> {
    if cells.len() < 3 {
        return None;
    }
    let first = cells[0].as_str();
    let second = cells[1].as_str();
    let third = cells[2].as_str();

    // Header-label rows shift the payload one cell to the right.
    let source_id = if first.contains(ID_HEADER_LABEL) {
        second
    } else {
        first
    };
    let raw_title = if second.contains(TITLE_HEADER_LABEL) {
        third
    } else {
        second
    };
    // The fourth cell, when present, is the dedicated description column.
    let description = match cells.get(3) {
        Some(fourth) if !fourth.is_empty() => fourth.clone(),
        _ => third.to_string(),
    };

    let title = strip_label_prefix(raw_title, TITLE_HEADER_LABEL);
    let description = strip_label_prefix(&description, DESCRIPTION_HEADER_LABEL);

    if title.is_empty() || description.is_empty() {
        return None;
    }
    if title == ID_HEADER_LABEL || title == TITLE_HEADER_LABEL {
        return None;
    }

    let category = infer_category(&format!("{title} {description}"));
    let problem_id = format!(
        "{}_{}_{}",
        edition_label(year),
        source_id,
        now.timestamp_millis()
    );
    Some(base_problem(
        problem_id,
        title,
        description,
        category.to_string(),
        year,
        now,
    ))
}

fn normalize_block(
    block: &BlockCandidate,
    year: i32,
    index: usize,
    now: DateTime<Utc>,
) -> Option<ProblemStatement> {
    let title = block
        .heading
        .clone()
        .or_else(|| {
            // Longest plausible text run stands in for a missing heading.
            block
                .texts
                .iter()
                .filter(|t| t.len() > 10 && t.len() < 200)
                .max_by_key(|t| t.len())
                .cloned()
        })
        .unwrap_or_else(|| format!("Problem Statement {index} - {EDITION_PREFIX} {year}"));

    let description = block
        .paragraphs
        .clone()
        .unwrap_or_else(|| truncate_chars(&block.full_text, MAX_DESCRIPTION_LEN));

    if title.is_empty() || description.is_empty() {
        return None;
    }
    if title == ID_HEADER_LABEL || title == TITLE_HEADER_LABEL {
        return None;
    }

    let category = match &block.category_hint {
        Some(hint) if !hint.is_empty() => hint.clone(),
        _ => infer_category(&block.full_text).to_string(),
    };

    let problem_id = format!("{}_{}_{}", edition_label(year), index, now.timestamp_millis());
    let mut problem = base_problem(problem_id, title, description, category, year, now);
    if let Some(org) = &block.organization_hint {
        problem.organization_name = org.clone();
    }
    Some(problem)
}

const SYNTHETIC_CATEGORIES: &[&str] = &[
    "Healthcare",
    "Education",
    "Agriculture",
    "Transport",
    "Energy",
    "Environment",
    "Finance",
    "Security",
    "Communication",
    "Smart City",
    "Rural Development",
    "Urban Planning",
    "Technology",
    "Innovation",
    "Disaster Management",
];

const SYNTHETIC_ORGANIZATIONS: &[&str] = &[
    "Ministry of Health and Family Welfare",
    "Ministry of Education",
    "Ministry of Agriculture and Farmers Welfare",
    "Ministry of Road Transport and Highways",
    "Ministry of Power",
    "Ministry of Environment, Forest and Climate Change",
    "Ministry of Finance",
    "Ministry of Home Affairs",
    "Ministry of Communications",
    "Ministry of Housing and Urban Affairs",
];

const SYNTHETIC_TECHNOLOGIES: &[&str] = &[
    "AI/ML",
    "Blockchain",
    "IoT",
    "Mobile App Development",
    "Web Development",
    "Data Analytics",
    "Cybersecurity",
    "Cloud Computing",
    "Robotics",
    "AR/VR",
];

const DIFFICULTY_CYCLE: &[Difficulty] = &[Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

fn synthetic_titles(category: &str) -> Option<&'static [&'static str]> {
    match category {
        "Healthcare" => Some(&[
            "Digital Health Records Management System",
            "AI-powered Disease Diagnosis Platform",
            "Telemedicine Solution for Rural Areas",
            "Medical Supply Chain Optimization",
            "Patient Monitoring and Alert System",
        ]),
        "Education" => Some(&[
            "Online Learning Platform for Rural Students",
            "AI-based Student Performance Analytics",
            "Digital Library Management System",
            "Skill Development Tracking Platform",
            "Educational Content Recommendation System",
        ]),
        "Agriculture" => Some(&[
            "Smart Farming IoT Solution",
            "Crop Disease Detection System",
            "Agricultural Supply Chain Management",
            "Weather-based Crop Advisory",
            "Soil Quality Monitoring System",
        ]),
        "Transport" => Some(&[
            "Smart Traffic Management System",
            "Public Transport Optimization",
            "Vehicle Fleet Management Solution",
            "Road Safety Monitoring System",
            "Intelligent Parking Management",
        ]),
        "Energy" => Some(&[
            "Renewable Energy Monitoring System",
            "Smart Grid Management Solution",
            "Energy Consumption Analytics",
            "Solar Panel Performance Tracking",
            "Energy Efficiency Optimization",
        ]),
        _ => None,
    }
}

/// Deterministic placeholder record for a year/index pair.
///
/// Field choices cycle through the fixed lists by index so repeated fallback
/// generation produces a category-diverse, reproducible dataset; only the
/// timestamp embedded in `problem_id` varies between invocations.
pub fn synthetic_problem(year: i32, index: usize, now: DateTime<Utc>) -> ProblemStatement {
    let category = SYNTHETIC_CATEGORIES[index % SYNTHETIC_CATEGORIES.len()];
    let organization = SYNTHETIC_ORGANIZATIONS[index % SYNTHETIC_ORGANIZATIONS.len()];
    let technology = SYNTHETIC_TECHNOLOGIES[index % SYNTHETIC_TECHNOLOGIES.len()];
    let difficulty = DIFFICULTY_CYCLE[index % DIFFICULTY_CYCLE.len()];

    let base_title = synthetic_titles(category)
        .map(|titles| titles[index % titles.len()].to_string())
        .unwrap_or_else(|| format!("{category} Innovation Platform"));
    let lower = category.to_lowercase();

    ProblemStatement {
        problem_id: format!(
            "{}_{}_{}_{}",
            edition_label(year),
            category.to_uppercase(),
            index,
            now.timestamp_millis()
        ),
        title: format!("{base_title} - {EDITION_PREFIX} {year}"),
        description: format!(
            "Develop a comprehensive solution for {lower} challenges. This problem focuses on \
             creating innovative technology solutions to address real-world issues in the {lower} \
             sector. The solution should be scalable, user-friendly, and demonstrate practical \
             application of modern technologies."
        ),
        category: category.to_string(),
        year,
        edition: edition_label(year),
        organization_name: organization.to_string(),
        organization_type: DEFAULT_ORGANIZATION_TYPE.to_string(),
        organization_sector: DEFAULT_ORGANIZATION_SECTOR.to_string(),
        technology: vec![technology.to_string()],
        domain: vec![category.to_string()],
        difficulty,
        expected_outcome: format!(
            "A working prototype or solution that addresses the {lower} challenge with clear \
             demonstration of functionality and potential impact."
        ),
        constraints: vec![
            "Budget constraints".to_string(),
            "Time limitations".to_string(),
            "Scalability requirements".to_string(),
            "User adoption considerations".to_string(),
        ],
        resources: vec![
            "Open source tools".to_string(),
            "Cloud platforms".to_string(),
            "Public datasets".to_string(),
            "Government APIs".to_string(),
        ],
        tags: vec![
            category.to_string(),
            edition_label(year),
            "Innovation".to_string(),
            "Technology".to_string(),
        ],
        complexity: (index % 3 + 1) as u8,
        estimated_effort: format!("{}-{} months", 2 + index % 3, 4 + index % 3),
        scraped_at: now,
        last_updated: now,
    }
}
