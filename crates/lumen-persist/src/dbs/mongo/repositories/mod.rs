mod chat;
mod jobs;
mod rows;
