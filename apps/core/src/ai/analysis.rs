//! Batch literature analysis shared by every adapter.
//!
//! One composite prompt goes out, one response comes back, and the four
//! fixed sections (summary, key findings, research suggestions, detailed
//! analysis) are parsed back out of the free text.

use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use tracing::{debug, warn};

use crate::ai::traits::ModelAdapter;
use crate::error::AppError;
use crate::keywords::tokenizer::is_cjk_ideograph;
use crate::models::{
    AnalysisOptions, AnalysisResult, GenerationOptions, ItemAnalysis, Language, LiteratureItem,
};

pub const MAX_LIST_ITEMS: usize = 5;
pub const MAX_TAGS: usize = 3;
const MAX_LISTED_AUTHORS: usize = 3;

/// Client-side token estimate used when a provider omits usage.
///
/// Text dominated by CJK ideographs counts about 1 token per 1.5 chars,
/// everything else about 1 token per 4 chars.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        return 0;
    }
    let visible = text.chars().filter(|c| !c.is_whitespace()).count() as u64;
    let cjk = text.chars().filter(|c| is_cjk_ideograph(*c)).count() as u64;

    let tokens = if cjk * 2 > visible {
        // ceil(chars / 1.5)
        (chars * 2).div_ceil(3)
    } else {
        chars.div_ceil(4)
    };
    tokens.min(u32::MAX as u64) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Summary,
    Findings,
    Suggestions,
    Details,
}

/// Header spellings per section, in the response language.
fn header_aliases(language: Language) -> &'static [(Section, &'static [&'static str])] {
    match language {
        Language::Zh => &[
            (Section::Summary, &["总体摘要", "整体摘要", "摘要", "总结", "概述"]),
            (Section::Findings, &["主要发现", "关键发现", "重要发现"]),
            (Section::Suggestions, &["研究建议", "未来研究方向", "建议"]),
            (Section::Details, &["详细分析", "逐篇分析", "文献分析"]),
        ],
        Language::En => &[
            (Section::Summary, &["overall summary", "summary", "overview"]),
            (Section::Findings, &["key findings", "main findings", "findings"]),
            (
                Section::Suggestions,
                &["research suggestions", "future research", "suggestions", "recommendations"],
            ),
            (
                Section::Details,
                &["detailed analysis", "per-article analysis", "individual analysis"],
            ),
        ],
    }
}

/// Sections parsed out of a raw analysis response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAnalysis {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub research_suggestions: Vec<String>,
    pub details: String,
}

/// Builds the single composite prompt for a batch of articles.
pub fn build_analysis_prompt(items: &[LiteratureItem], language: Language) -> String {
    let mut prompt = match language {
        Language::Zh => format!(
            "请基于以下{}篇PubMed文献进行综合分析，并严格按照以下格式用中文回答：\n\n\
             ## 总体摘要\n（概括这些文献的整体研究主题与核心结论）\n\n\
             ## 主要发现\n（列出3-5条关键发现，每条一行，以序号开头）\n\n\
             ## 研究建议\n（给出3-5条后续研究建议，每条一行，以序号开头）\n\n\
             ## 详细分析\n（逐篇分析，每篇以“文献N：”开头，说明研究设计、主要结论与局限性）\n\n\
             文献列表：\n",
            items.len()
        ),
        Language::En => format!(
            "Analyze the following {} PubMed articles and answer in English using exactly this structure:\n\n\
             ## Overall Summary\n(the overall research theme and core conclusions)\n\n\
             ## Key Findings\n(3-5 key findings, one numbered line each)\n\n\
             ## Research Suggestions\n(3-5 suggestions for future research, one numbered line each)\n\n\
             ## Detailed Analysis\n(one paragraph per article starting with \"Article N:\", covering design, conclusions and limitations)\n\n\
             Articles:\n",
            items.len()
        ),
    };

    for (i, item) in items.iter().enumerate() {
        prompt.push('\n');
        prompt.push_str(&format_item(i + 1, item, language));
    }
    prompt
}

fn format_item(index: usize, item: &LiteratureItem, language: Language) -> String {
    let (unknown, no_abstract, et_al) = match language {
        Language::Zh => ("未知", "无摘要", " 等"),
        Language::En => ("Unknown", "No abstract available", " et al."),
    };

    let mut authors = item
        .authors
        .iter()
        .take(MAX_LISTED_AUTHORS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if authors.is_empty() {
        authors = unknown.to_string();
    } else if item.authors.len() > MAX_LISTED_AUTHORS {
        authors.push_str(et_al);
    }

    let or_default = |value: &str, fallback: &str| {
        if value.trim().is_empty() {
            fallback.to_string()
        } else {
            value.trim().to_string()
        }
    };
    let title = or_default(&item.title, unknown);
    let journal = or_default(&item.journal, unknown);
    let year = or_default(item.year.as_deref().unwrap_or_default(), unknown);
    let abstract_text = or_default(&item.abstract_text, no_abstract);

    match language {
        Language::Zh => format!(
            "文献{}\n标题：{}\n作者：{}\n期刊：{}\n年份：{}\n摘要：{}\n",
            index, title, authors, journal, year, abstract_text
        ),
        Language::En => format!(
            "Article {}\nTitle: {}\nAuthors: {}\nJournal: {}\nYear: {}\nAbstract: {}\n",
            index, title, authors, journal, year, abstract_text
        ),
    }
}

fn system_prompt(language: Language) -> &'static str {
    match language {
        Language::Zh => "你是一名严谨的生物医学文献分析专家。",
        Language::En => "You are a rigorous biomedical literature analyst.",
    }
}

/// Recognizes a section header line; returns the section and any inline
/// content after a trailing colon.
fn match_header(line: &str, language: Language) -> Option<(Section, String)> {
    let stripped = line
        .trim()
        .trim_start_matches(|c: char| {
            c == '#' || c == '*' || c.is_ascii_digit() || matches!(c, '.' | '、' | ')' | '）')
        })
        .trim_start()
        .trim_start_matches(['一', '二', '三', '四', '、'])
        .trim();
    let lowered = stripped.to_lowercase();

    for (section, aliases) in header_aliases(language) {
        for alias in aliases.iter() {
            let Some(rest) = lowered.strip_prefix(alias) else {
                continue;
            };
            let rest = rest.trim_start_matches('*').trim();
            if rest.is_empty() || rest.trim_end_matches([':', '：', '*']).trim().is_empty() {
                return Some((*section, String::new()));
            }
            if let Some(inline) = rest.strip_prefix([':', '：']) {
                // Re-slice the original casing from the stripped line.
                let offset = stripped.len().saturating_sub(inline.len());
                let inline = stripped
                    .get(offset..)
                    .unwrap_or(inline)
                    .trim_matches(|c: char| c == '*' || c.is_whitespace());
                return Some((*section, inline.to_string()));
            }
        }
    }
    None
}

/// Splits a raw response into its four sections.
///
/// When no header matches, the whole response becomes the summary.
pub fn parse_analysis(text: &str, language: Language) -> ParsedAnalysis {
    let mut buckets: [Vec<String>; 4] = Default::default();
    let mut current: Option<Section> = None;
    let mut found_header = false;

    for line in text.lines() {
        if let Some((section, inline)) = match_header(line, language) {
            found_header = true;
            current = Some(section);
            if !inline.is_empty() {
                buckets[section as usize].push(inline);
            }
            continue;
        }
        if let Some(section) = current {
            buckets[section as usize].push(line.to_string());
        }
    }

    if !found_header {
        return ParsedAnalysis {
            summary: text.trim().to_string(),
            ..ParsedAnalysis::default()
        };
    }

    let [summary, findings, suggestions, details] = buckets;
    ParsedAnalysis {
        summary: summary.join("\n").trim().to_string(),
        key_findings: list_items(&findings),
        research_suggestions: list_items(&suggestions),
        details: details.join("\n").trim().to_string(),
    }
}

/// Non-empty lines with list markers removed, capped at [`MAX_LIST_ITEMS`].
fn list_items(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| strip_list_marker(line))
        .filter(|line| !line.is_empty())
        .take(MAX_LIST_ITEMS)
        .collect()
}

fn strip_list_marker(line: &str) -> String {
    let line = line.trim();
    let line = line.trim_start_matches(['-', '*', '•', '·', '+']).trim_start();

    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    let line = if digits > 0 {
        let rest = &line[digits..];
        match rest.chars().next() {
            Some(c @ ('.' | '、' | ')' | '）' | ':' | '：')) => &rest[c.len_utf8()..],
            _ => line,
        }
    } else {
        line
    };
    line.trim().trim_matches('*').trim().to_string()
}

fn item_marker(language: Language) -> &'static Regex {
    static ZH: OnceLock<Regex> = OnceLock::new();
    static EN: OnceLock<Regex> = OnceLock::new();
    match language {
        Language::Zh => ZH.get_or_init(|| {
            Regex::new(r"文献\s*(\d+)").unwrap_or_else(|e| panic!("invalid marker regex: {e}"))
        }),
        Language::En => EN.get_or_init(|| {
            Regex::new(r"(?i)\b(?:article|literature|paper)\s*#?(\d+)")
                .unwrap_or_else(|e| panic!("invalid marker regex: {e}"))
        }),
    }
}

/// Paragraph of the detailed-analysis section that belongs to article `index` (1-based).
fn item_paragraph(details: &str, index: usize, language: Language) -> Option<String> {
    let marker = item_marker(language);
    let mut collecting = false;
    let mut paragraph: Vec<&str> = Vec::new();

    for line in details.lines() {
        let numbered = marker
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok());
        match numbered {
            Some(n) if n == index => {
                collecting = true;
                paragraph.push(line);
            }
            Some(_) if collecting => break,
            _ if collecting => paragraph.push(line),
            _ => {}
        }
    }

    let text = paragraph.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn placeholder(index: usize, language: Language) -> String {
    match language {
        Language::Zh => format!("文献{}的详细分析请参见完整的分析结果。", index),
        Language::En => format!("See the full analysis for article {}.", index),
    }
}

/// Study-type vocabulary: (Chinese label, English label, match patterns).
const STUDY_TYPES: &[(&str, &str, &[&str])] = &[
    ("随机对照试验", "Randomized Controlled Trial", &["randomized controlled", "randomised controlled", "随机对照"]),
    ("Meta分析", "Meta-Analysis", &["meta-analysis", "meta analysis", "荟萃分析", "meta分析"]),
    ("系统综述", "Systematic Review", &["systematic review", "系统综述", "系统评价"]),
    ("队列研究", "Cohort Study", &["cohort", "队列"]),
    ("病例对照研究", "Case-Control Study", &["case-control", "case control", "病例对照"]),
    ("横断面研究", "Cross-Sectional Study", &["cross-sectional", "cross sectional", "横断面"]),
    ("临床试验", "Clinical Trial", &["clinical trial", "临床试验"]),
    ("病例报告", "Case Report", &["case report", "病例报告", "个案报道"]),
    ("文献综述", "Review", &["narrative review", "literature review", "文献综述"]),
    ("动物实验", "Animal Study", &["mice", "murine", "rat model", "animal model", "小鼠", "大鼠", "动物实验"]),
    ("体外研究", "In Vitro Study", &["in vitro", "体外"]),
];

/// Matches an article's title and abstract against the study-type vocabulary.
pub fn extract_tags(item: &LiteratureItem, language: Language) -> Vec<String> {
    let haystack = format!("{} {}", item.title, item.abstract_text).to_lowercase();
    STUDY_TYPES
        .iter()
        .filter(|(_, _, patterns)| patterns.iter().any(|p| haystack.contains(p)))
        .map(|(zh, en, _)| match language {
            Language::Zh => zh.to_string(),
            Language::En => en.to_string(),
        })
        .take(MAX_TAGS)
        .collect()
}

/// Default `batch_analyze`: exactly one `generate_text` call on `adapter`.
pub async fn run_batch_analysis<A: ModelAdapter + ?Sized>(
    adapter: &A,
    items: &[LiteratureItem],
    options: &AnalysisOptions,
) -> Result<AnalysisResult, AppError> {
    if items.is_empty() {
        return Err(AppError::Validation(
            "At least one literature item is required for analysis".to_string(),
        ));
    }

    let started = Instant::now();
    let language = options.language;
    let prompt = build_analysis_prompt(items, language);
    let generation = GenerationOptions {
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        system_prompt: Some(system_prompt(language).to_string()),
        preferred_model: options.preferred_model.clone(),
        ..GenerationOptions::default()
    };

    debug!("Batch analysis of {} items via {}", items.len(), adapter.provider());
    let result = adapter.generate_text(&prompt, &generation).await?;
    let parsed = parse_analysis(&result.text, language);
    if parsed.key_findings.is_empty() && parsed.details.is_empty() {
        warn!("Analysis response had no recognizable sections, using it as summary");
    }

    let analyses = items
        .iter()
        .enumerate()
        .map(|(i, item)| ItemAnalysis {
            index: i + 1,
            title: item.title.clone(),
            analysis: item_paragraph(&parsed.details, i + 1, language)
                .unwrap_or_else(|| placeholder(i + 1, language)),
            tags: extract_tags(item, language),
        })
        .collect();

    Ok(AnalysisResult {
        summary: parsed.summary,
        key_findings: parsed.key_findings,
        research_suggestions: parsed.research_suggestions,
        analyses,
        usage: result.usage,
        cost: result.cost,
        processing_time_ms: started.elapsed().as_millis() as u64,
        model: result.model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, abstract_text: &str) -> LiteratureItem {
        LiteratureItem {
            title: title.to_string(),
            abstract_text: abstract_text.to_string(),
            authors: vec!["Li W".into(), "Smith J".into(), "Chen Y".into(), "Doe A".into()],
            journal: "Lancet".to_string(),
            year: Some("2023".to_string()),
            ..LiteratureItem::default()
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcde"), 2);
        // 3 CJK chars -> ceil(3 / 1.5) = 2
        assert_eq!(estimate_tokens("肺癌的"), 2);
        assert_eq!(estimate_tokens("肺癌治疗"), 3);
    }

    #[test]
    fn test_prompt_contains_sections_and_items() {
        let items = vec![item("Aspirin in stroke", "We enrolled 100 patients.")];

        let zh = build_analysis_prompt(&items, Language::Zh);
        for header in ["总体摘要", "主要发现", "研究建议", "详细分析"] {
            assert!(zh.contains(header), "missing {}", header);
        }
        assert!(zh.contains("作者：Li W, Smith J, Chen Y 等"));
        assert!(zh.contains("年份：2023"));

        let en = build_analysis_prompt(&items, Language::En);
        assert!(en.contains("## Key Findings"));
        assert!(en.contains("Authors: Li W, Smith J, Chen Y et al."));
        assert!(en.contains("Journal: Lancet"));
    }

    #[test]
    fn test_prompt_fills_missing_fields() {
        let bare = LiteratureItem {
            title: "Untitled".into(),
            ..LiteratureItem::default()
        };
        let en = build_analysis_prompt(&[bare], Language::En);
        assert!(en.contains("Authors: Unknown"));
        assert!(en.contains("Abstract: No abstract available"));
    }

    #[test]
    fn test_parse_english_sections() {
        let text = "## Overall Summary\nAspirin reduces recurrence.\n\n\
                    ## Key Findings\n1. Lower recurrence\n2. Bleeding risk is modest\n- Works in elderly\n\n\
                    ## Research Suggestions\n1. Longer follow-up\n\n\
                    ## Detailed Analysis\nArticle 1: A large RCT.\nStrong design.\nArticle 2: A small cohort.";
        let parsed = parse_analysis(text, Language::En);

        assert_eq!(parsed.summary, "Aspirin reduces recurrence.");
        assert_eq!(
            parsed.key_findings,
            vec!["Lower recurrence", "Bleeding risk is modest", "Works in elderly"]
        );
        assert_eq!(parsed.research_suggestions, vec!["Longer follow-up"]);
        assert_eq!(
            item_paragraph(&parsed.details, 1, Language::En).as_deref(),
            Some("Article 1: A large RCT.\nStrong design.")
        );
        assert_eq!(
            item_paragraph(&parsed.details, 2, Language::En).as_deref(),
            Some("Article 2: A small cohort.")
        );
        assert_eq!(item_paragraph(&parsed.details, 3, Language::En), None);
    }

    #[test]
    fn test_parse_chinese_sections_with_bold_headers() {
        let text = "**一、总体摘要**\n阿司匹林降低复发。\n**二、主要发现**：\n1、复发率下降\n2、出血风险可控\n\
                    **三、研究建议**\n- 延长随访\n**四、详细分析**\n文献1：大型随机对照试验。";
        let parsed = parse_analysis(text, Language::Zh);

        assert_eq!(parsed.summary, "阿司匹林降低复发。");
        assert_eq!(parsed.key_findings, vec!["复发率下降", "出血风险可控"]);
        assert_eq!(parsed.research_suggestions, vec!["延长随访"]);
        assert_eq!(parsed.details, "文献1：大型随机对照试验。");
    }

    #[test]
    fn test_inline_header_content() {
        let parsed = parse_analysis("Summary: Short answer.\nKey findings:\n1. One", Language::En);
        assert_eq!(parsed.summary, "Short answer.");
        assert_eq!(parsed.key_findings, vec!["One"]);
    }

    #[test]
    fn test_unstructured_response_becomes_summary() {
        let text = "The articles broadly agree that the drug is safe.";
        let parsed = parse_analysis(text, Language::En);
        assert_eq!(parsed.summary, text);
        assert!(parsed.key_findings.is_empty());
        assert!(parsed.research_suggestions.is_empty());

        // Headers of the other language do not count.
        let parsed = parse_analysis("## 主要发现\n1. x", Language::En);
        assert_eq!(parsed.summary, "## 主要发现\n1. x");
    }

    #[test]
    fn test_lists_are_capped() {
        let text = "## Key Findings\n1. a\n2. b\n3. c\n4. d\n5. e\n6. f\n7. g";
        let parsed = parse_analysis(text, Language::En);
        assert_eq!(parsed.key_findings.len(), MAX_LIST_ITEMS);
        assert_eq!(parsed.key_findings[4], "e");
    }

    #[test]
    fn test_extract_tags() {
        let rct = item(
            "A randomized controlled trial and meta-analysis",
            "Pooled cohort data from a systematic review; in vitro assays in mice.",
        );
        let tags = extract_tags(&rct, Language::En);
        assert_eq!(
            tags,
            vec!["Randomized Controlled Trial", "Meta-Analysis", "Systematic Review"]
        );

        let zh = item("一项队列研究", "基于体外实验");
        assert_eq!(extract_tags(&zh, Language::Zh), vec!["队列研究", "体外研究"]);

        let none = item("Opinion", "Nothing to see.");
        assert!(extract_tags(&none, Language::En).is_empty());
    }
}
