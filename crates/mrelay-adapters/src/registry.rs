use std::collections::HashMap;

use mrelay_storage::ChannelType;

use crate::adapter::Adapter;
use crate::ali::AliAdapter;
use crate::baidu::BaiduAdapter;
use crate::claude::ClaudeAdapter;
use crate::cloudflare::CloudflareAdapter;
use crate::cohere::CohereAdapter;
use crate::gemini::GeminiAdapter;
use crate::midjourney::MidjourneyAdapter;
use crate::openai::OpenAiAdapter;
use crate::suno::SunoAdapter;
use crate::zhipu::ZhipuAdapter;

type Factory = Box<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

/// Provider type -> adapter factory. One fresh adapter per request so that
/// `init` can hold request-scoped state.
pub struct AdapterRegistry {
    factories: HashMap<ChannelType, Factory>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl AdapterRegistry {
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(ChannelType::OpenAi, || Box::new(OpenAiAdapter::new()));
        registry.register(ChannelType::Anthropic, || Box::new(ClaudeAdapter::new()));
        registry.register(ChannelType::Gemini, || Box::new(GeminiAdapter::new()));
        registry.register(ChannelType::Baidu, || Box::new(BaiduAdapter::new()));
        registry.register(ChannelType::Ali, || Box::new(AliAdapter::new()));
        registry.register(ChannelType::Zhipu, || Box::new(ZhipuAdapter::new()));
        registry.register(ChannelType::Cohere, || Box::new(CohereAdapter::new()));
        registry.register(ChannelType::Cloudflare, || {
            Box::new(CloudflareAdapter::new())
        });
        registry.register(ChannelType::Midjourney, || {
            Box::new(MidjourneyAdapter::new())
        });
        registry.register(ChannelType::Suno, || Box::new(SunoAdapter::new()));
        // OpenAI-dialect providers differ only in their base URL.
        for kind in [
            ChannelType::Mistral,
            ChannelType::Moonshot,
            ChannelType::DeepSeek,
            ChannelType::Groq,
            ChannelType::OpenRouter,
            ChannelType::Xai,
            ChannelType::Perplexity,
            ChannelType::Ollama,
        ] {
            registry.register(kind, || Box::new(OpenAiAdapter::new()));
        }
        registry
    }

    pub fn register<F>(&mut self, kind: ChannelType, factory: F)
    where
        F: Fn() -> Box<dyn Adapter> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn build(&self, kind: ChannelType) -> Option<Box<dyn Adapter>> {
        self.factories.get(&kind).map(|factory| factory())
    }
}

/// Base URL used when the channel does not override one.
pub fn default_base_url(kind: ChannelType) -> &'static str {
    match kind {
        ChannelType::OpenAi => "https://api.openai.com",
        ChannelType::Anthropic => "https://api.anthropic.com",
        ChannelType::Gemini => "https://generativelanguage.googleapis.com",
        ChannelType::Baidu => "https://aip.baidubce.com",
        ChannelType::Ali => "https://dashscope.aliyuncs.com",
        ChannelType::Zhipu => "https://open.bigmodel.cn",
        ChannelType::Cohere => "https://api.cohere.ai",
        ChannelType::Cloudflare => "https://api.cloudflare.com",
        ChannelType::Ollama => "http://localhost:11434",
        ChannelType::Mistral => "https://api.mistral.ai",
        ChannelType::Moonshot => "https://api.moonshot.cn",
        ChannelType::DeepSeek => "https://api.deepseek.com",
        ChannelType::Groq => "https://api.groq.com/openai",
        ChannelType::OpenRouter => "https://openrouter.ai/api",
        ChannelType::Xai => "https://api.x.ai",
        ChannelType::Perplexity => "https://api.perplexity.ai",
        ChannelType::Midjourney => "",
        ChannelType::Suno => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_channel_type_resolves_an_adapter() {
        let registry = AdapterRegistry::with_builtin();
        for raw in 1..=18 {
            let kind = ChannelType::from_i32(raw).unwrap();
            assert!(registry.build(kind).is_some(), "no adapter for {kind:?}");
        }
    }
}
