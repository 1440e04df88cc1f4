//! Lifecycle rule conversion to the S3 API types

use crate::config::{LifecycleRuleConf, RuleFilterConf, RuleStatus, TagConf};
use aws_sdk_s3::error::BuildError;
use aws_sdk_s3::primitives::DateTime as SdkDateTime;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleAndOperator, LifecycleRuleFilter, NoncurrentVersionExpiration,
    NoncurrentVersionTransition, Tag, Transition, TransitionStorageClass,
};
use chrono::NaiveDate;

fn days(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn midnight(date: NaiveDate) -> SdkDateTime {
    let secs = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default();
    SdkDateTime::from_secs(secs)
}

fn tag(conf: &TagConf) -> Result<Tag, BuildError> {
    Tag::builder().key(&conf.key).value(&conf.value).build()
}

fn filter(conf: &RuleFilterConf) -> Result<LifecycleRuleFilter, BuildError> {
    let builder = LifecycleRuleFilter::builder();
    let builder = if let Some(and) = &conf.and {
        builder.and(
            LifecycleRuleAndOperator::builder()
                .set_prefix(and.prefix.clone())
                .set_tags(Some(and.tags.iter().map(tag).collect::<Result<Vec<_>, _>>()?))
                .build(),
        )
    } else if let Some(single) = &conf.tag {
        builder.tag(tag(single)?)
    } else {
        builder.prefix(conf.prefix.clone().unwrap_or_default())
    };
    Ok(builder.build())
}

/// One configured rule as an S3 `LifecycleRule`
pub fn to_lifecycle_rule(conf: &LifecycleRuleConf) -> Result<LifecycleRule, BuildError> {
    let status = match conf.status {
        RuleStatus::Enabled => ExpirationStatus::Enabled,
        RuleStatus::Disabled => ExpirationStatus::Disabled,
    };

    let mut rule = LifecycleRule::builder()
        .id(&conf.id)
        .status(status)
        .filter(filter(&conf.filter)?);

    if let Some(expiration) = &conf.expiration {
        rule = rule.expiration(
            LifecycleExpiration::builder()
                .set_days(expiration.days.map(days))
                .set_date(expiration.date.map(midnight))
                .build(),
        );
    }

    for transition in &conf.transitions {
        rule = rule.transitions(
            Transition::builder()
                .set_days(transition.days.map(days))
                .set_date(transition.date.map(midnight))
                .storage_class(TransitionStorageClass::from(transition.storage_class.as_str()))
                .build(),
        );
    }

    if let Some(noncurrent) = &conf.noncurrent_version_expiration {
        rule = rule.noncurrent_version_expiration(
            NoncurrentVersionExpiration::builder()
                .noncurrent_days(days(noncurrent.noncurrent_days))
                .build(),
        );
    }

    for transition in &conf.noncurrent_version_transitions {
        rule = rule.noncurrent_version_transitions(
            NoncurrentVersionTransition::builder()
                .noncurrent_days(days(transition.noncurrent_days))
                .storage_class(TransitionStorageClass::from(transition.storage_class.as_str()))
                .build(),
        );
    }

    rule.build()
}

/// Bucket lifecycle document for all configured rules
pub fn to_bucket_configuration(
    rules: &[LifecycleRuleConf],
) -> Result<BucketLifecycleConfiguration, BuildError> {
    let rules = rules
        .iter()
        .map(to_lifecycle_rule)
        .collect::<Result<Vec<_>, _>>()?;
    BucketLifecycleConfiguration::builder()
        .set_rules(Some(rules))
        .build()
}
