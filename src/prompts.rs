use anyhow::Result;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::Deserialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::{GenerationParams, GenerationRequest};
use crate::config::{GenerationConfig, InputConfig, PromptSet};

/// A prompt to be sent to the server.
///
/// Prompt files are JSONL: one object per line with a "prompt" field and an
/// optional "max_tokens" field overriding the configured limit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prompt {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Prompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: None,
        }
    }

    pub fn to_request(&self, generation: &GenerationConfig) -> GenerationRequest {
        let mut params = GenerationParams::from(generation);
        if self.max_tokens.is_some() {
            params.max_tokens = self.max_tokens;
        }
        GenerationRequest::from_prompt(self.prompt.clone(), params)
    }
}

pub const ENGLISH_QUESTIONS: [&str; 20] = [
    "Analyze the concept of justice in Plato's 'Republic,' comparing it to modern interpretations. Please provide a lengthy answer.",
    "Explain in detail the process of photosynthesis, including both the light-dependent and light-independent reactions. Please give a lengthy answer.",
    "Discuss the themes of identity and alienation in Franz Kafka's 'The Metamorphosis.' Provide a detailed and lengthy response.",
    "Examine the causes and consequences of the French Revolution. Please provide a comprehensive and lengthy answer.",
    "Analyze the effects of globalization on emerging economies, providing examples. Please give a lengthy response.",
    "Discuss the ethical implications of artificial intelligence in modern society. Provide a detailed and lengthy answer.",
    "Explore the evolution of Impressionism in art, citing key artists and works. Please provide a lengthy response.",
    "Explain Jean Piaget's stages of cognitive development, providing examples for each stage. Please give a lengthy answer.",
    "Discuss the impacts of deforestation on biodiversity and climate change. Provide a detailed and lengthy response.",
    "Analyze the role of social media in shaping public opinion. Please provide a lengthy answer.",
    "Examine the concept of democracy in ancient Athens compared to modern democratic systems. Please give a lengthy answer.",
    "Discuss the benefits and challenges of universal healthcare systems. Provide a detailed and lengthy response.",
    "Analyze the impact of technology on modern education. Please provide a lengthy answer.",
    "Discuss the cultural significance of rituals in indigenous societies. Please give a lengthy response.",
    "Examine the role of religion in shaping moral values across different societies. Please provide a detailed and lengthy answer.",
    "Discuss the importance of the separation of powers in a democratic government. Please provide a lengthy answer.",
    "Analyze the ethical considerations in genetic engineering. Please give a detailed and lengthy response.",
    "Explore the influence of African music on contemporary genres. Please provide a lengthy answer.",
    "Explain the life cycle of a star, from birth to death. Please give a detailed and lengthy answer.",
    "Discuss the impact of leadership styles on organizational performance. Provide a lengthy answer.",
];

pub const TRADITIONAL_CHINESE_QUESTIONS: [&str; 20] = [
    "分析柏拉圖《理想國》中正義的概念，並與現代詮釋進行比較。請提供詳盡的回答。",
    "詳細解釋光合作用的過程，包括光反應和暗反應。請給出長篇回答。",
    "討論卡夫卡《變形記》中的身份和疏離主題。請提供詳細且長篇的回應。",
    "考察法國大革命的原因和後果。請提供全面且詳盡的回答。",
    "分析全球化對新興經濟體的影響，並舉例說明。請提供長篇回應。",
    "討論人工智能在現代社會的倫理影響。請給出詳細且長篇的回答。",
    "探索印象派藝術的演變，列舉主要藝術家和作品。請提供長篇回應。",
    "解釋皮亞傑提出的認知發展階段，為每個階段提供例子。請給出詳盡的回答。",
    "討論森林砍伐對生物多樣性和氣候變化的影響。請提供長篇回答。",
    "分析社交媒體在塑造公眾意見中的角色。請提供詳細且長篇的回應。",
    "考察古雅典的民主概念與現代民主制度的比較。請提供長篇回答。",
    "討論全民醫療保健系統的優點和挑戰。請給出長篇回答。",
    "分析科技對現代教育的影響。請提供長篇回應。",
    "討論儀式在原住民社會中的文化意義。請提供詳細且長篇的回答。",
    "考察宗教在塑造不同社會道德價值觀中的角色。請給出長篇回答。",
    "討論權力分立在民主政府中的重要性。請提供長篇回答。",
    "分析基因工程的倫理考量。請提供詳細且長篇的回應。",
    "探索非洲音樂對當代音樂流派的影響。請給出長篇回答。",
    "解釋恆星的生命週期，從誕生到死亡。請提供詳細且長篇的回答。",
    "討論領導風格對組織績效的影響。請提供長篇回應。",
];

/// Built-in question set; `All` is English followed by Traditional Chinese.
pub fn builtin(set: PromptSet) -> Vec<Prompt> {
    let questions: Vec<&str> = match set {
        PromptSet::English => ENGLISH_QUESTIONS.to_vec(),
        PromptSet::TraditionalChinese => TRADITIONAL_CHINESE_QUESTIONS.to_vec(),
        PromptSet::All => ENGLISH_QUESTIONS
            .iter()
            .chain(TRADITIONAL_CHINESE_QUESTIONS.iter())
            .copied()
            .collect(),
    };
    questions.into_iter().map(Prompt::new).collect()
}

/// Load the prompts described by the input configuration, then apply
/// sampling and shuffling.
pub async fn load_prompts(input: &InputConfig) -> Result<Vec<Prompt>> {
    let prompts = match &input.file {
        Some(path) => {
            let prompts = read_prompt_file(path).await?;
            info!("Loaded {} prompts from {}", prompts.len(), path.display());
            prompts
        }
        None => builtin(input.set),
    };

    let mut prompts: Vec<Prompt> = if let Some(sample_size) = input.sample_size {
        prompts.into_iter().take(sample_size).collect()
    } else {
        prompts
    };

    if input.shuffle {
        let mut rng = thread_rng();
        prompts.shuffle(&mut rng);
        debug!("Shuffled {} prompts", prompts.len());
    }

    if prompts.is_empty() {
        anyhow::bail!("No prompts to send");
    }

    Ok(prompts)
}

async fn read_prompt_file(path: &Path) -> Result<Vec<Prompt>> {
    let file = File::open(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open prompt file {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut prompts = Vec::new();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Prompt>(&line) {
            Ok(prompt) => prompts.push(prompt),
            Err(e) => warn!("Skipping prompt line {}: {}", line_number, e),
        }
    }

    Ok(prompts)
}
