//! Seed stopword lists for the keyword engine.
//!
//! The English list mixes ordinary function words with the boilerplate
//! vocabulary of biomedical abstracts ("study", "results", "methods"...),
//! which would otherwise dominate every PubMed result set.

/// Stopwords for English language, including abstract boilerplate
pub const STOPWORDS_EN: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "nor", "for", "yet", "so", "i", "you", "he", "she", "it",
    "we", "they", "me", "him", "her", "us", "them", "my", "your", "his", "its", "our", "their",
    "this", "that", "these", "those", "who", "whom", "which", "what", "whose", "is", "am", "are",
    "was", "were", "be", "been", "being", "have", "has", "had", "having", "do", "does", "did",
    "doing", "will", "would", "shall", "should", "can", "could", "may", "might", "must", "in",
    "on", "at", "to", "from", "by", "with", "about", "against", "between", "into", "through",
    "during", "before", "after", "above", "below", "up", "down", "out", "off", "over", "under",
    "again", "further", "here", "there", "where", "when", "why", "how", "all", "each", "every",
    "both", "few", "more", "most", "other", "some", "any", "no", "not", "only", "own", "same",
    "than", "too", "very", "just", "also", "now", "then", "once", "if", "because", "as", "until",
    "while", "although", "though", "however", "therefore", "thus", "among", "within", "without",
    "via", "per", "such", "well", "whether", "either", "neither", "upon", "whereas",
    // Abstract boilerplate
    "study", "studies", "trial", "trials", "result", "results", "method", "methods",
    "conclusion", "conclusions", "background", "objective", "objectives", "aim", "aims",
    "purpose", "introduction", "discussion", "analysis", "analyses", "data", "using", "used",
    "use", "based", "showed", "shown", "show", "found", "find", "findings", "reported",
    "report", "observed", "performed", "including", "included", "include", "compared",
    "associated", "significant", "significantly", "respectively", "total", "group", "groups",
    "years", "year", "patients", "patient", "two", "three", "one", "new",
    "suggest", "suggests", "present", "paper", "article", "review", "evidence",
];

/// Stopwords for Chinese: function characters only.
///
/// CJK text is tokenized one ideograph at a time, so every entry is a
/// single character.
pub const STOPWORDS_ZH: &[&str] = &[
    "的", "了", "是", "在", "和", "与", "及", "等", "对", "中", "为", "有", "也", "而", "被",
    "这", "那", "之", "或", "其", "我", "你", "他", "她", "们", "将", "从", "以", "于", "并",
    "由", "把", "就", "都", "又", "个", "一", "种", "可", "此", "该", "各", "则", "但", "因",
    "如", "即", "已", "所", "着", "过", "向", "后", "再", "至", "更", "很", "还", "却", "乃",
];
